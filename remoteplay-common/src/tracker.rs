//! Long-running device tracker: broadcasts searches on a fixed interval,
//! counts unanswered polls, and backs off hosts that just went to standby.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use log::{debug, info, warn};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{self, Instant},
};

use crate::{
    ConsoleType, RemotePlayError,
    ddp::{self, DeviceStatus},
    device::{Device, StatusChange},
    stop::StopToken,
};

pub const DEFAULT_MAX_POLLS: u32 = 5;
pub const DEFAULT_STANDBY_DELAY: Duration = Duration::from_secs(50);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Status notifications delivered to the tracker's subscriber.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    StatusUpdated {
        host: IpAddr,
        status: DeviceStatus,
    },
    /// The device missed enough polls that its status was cleared.
    StatusLost {
        host: IpAddr,
    },
}

struct TrackedDevice {
    device: Device,
    discovered: bool,
    poll_count: u32,
    polls_disabled: bool,
    standby_start: Option<Instant>,
}

impl TrackedDevice {
    fn new(host: IpAddr, discovered: bool) -> Self {
        Self {
            device: Device::new(host),
            discovered,
            poll_count: 0,
            polls_disabled: false,
            standby_start: None,
        }
    }

    /// Advance poll bookkeeping for one tick. Returns whether the device
    /// should receive a directed search and whether its status was lost.
    fn tick(&mut self, now: Instant, max_polls: u32, standby_delay: Duration) -> (bool, bool) {
        if self.polls_disabled {
            // Hosts ignore polls for a while right after entering standby.
            let elapsed = self
                .standby_start
                .map(|start| now.duration_since(start))
                .unwrap_or(standby_delay);
            if elapsed < standby_delay {
                debug!(
                    "polls disabled for {} for {:?} more",
                    self.device.host(),
                    standby_delay - elapsed
                );
                return (false, false);
            }
            self.polls_disabled = false;
        }

        self.poll_count += 1;
        let mut lost = false;
        if self.poll_count > max_polls {
            self.device.set_status(None);
            self.poll_count = 0;
            lost = true;
        }
        let directed = !self.discovered;
        (directed, lost)
    }

    fn record_status(&mut self, status: DeviceStatus, now: Instant) -> StatusChange {
        self.poll_count = 0;
        let change = self.device.set_status(Some(status));
        if change == StatusChange::WentToStandby {
            info!(
                "device {} went to standby, disabling polls",
                self.device.host()
            );
            self.standby_start = Some(now);
            self.polls_disabled = true;
        }
        change
    }
}

/// Poll tracker for known and discovered devices. Owns its socket for the
/// lifetime of [`DeviceTracker::run`]; status changes are published on an
/// event channel.
pub struct DeviceTracker {
    devices: HashMap<IpAddr, TrackedDevice>,
    max_polls: u32,
    standby_delay: Duration,
    events: mpsc::UnboundedSender<TrackerEvent>,
    stop: StopToken,
}

impl DeviceTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                devices: HashMap::new(),
                max_polls: DEFAULT_MAX_POLLS,
                standby_delay: DEFAULT_STANDBY_DELAY,
                events,
                stop: StopToken::new(),
            },
            receiver,
        )
    }

    pub fn set_max_polls(&mut self, max_polls: u32) {
        self.max_polls = max_polls;
    }

    /// Track a device that may not be reachable by broadcast. It will be
    /// polled directly on every tick.
    pub fn add_device(&mut self, host: IpAddr) {
        self.devices
            .entry(host)
            .or_insert_with(|| TrackedDevice::new(host, false));
    }

    pub fn remove_device(&mut self, host: IpAddr) {
        self.devices.remove(&host);
    }

    pub fn device(&self, host: IpAddr) -> Option<&Device> {
        self.devices.get(&host).map(|entry| &entry.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().map(|entry| &entry.device)
    }

    /// Handle for shutting the run loop down from another task.
    pub fn shutdown_handle(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run the poll loop until the shutdown handle fires.
    pub async fn run(&mut self, interval: Duration) -> Result<(), RemotePlayError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        info!(
            "device tracker running on port {}",
            socket.local_addr()?.port()
        );

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut buf = [0u8; 1024];
        let stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = ticker.tick() => self.poll(&socket).await?,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr.ip()),
                    Err(err) => warn!("tracker receive error: {err}"),
                },
            }
        }
        info!("device tracker stopped");
        Ok(())
    }

    async fn poll(&mut self, socket: &UdpSocket) -> Result<(), RemotePlayError> {
        let message = ddp::search_message();
        for kind in ConsoleType::ALL {
            socket
                .send_to(message.as_bytes(), (ddp::BROADCAST, kind.ddp_port()))
                .await?;
        }

        let now = Instant::now();
        let mut directed = Vec::new();
        let mut lost = Vec::new();
        for (host, entry) in &mut self.devices {
            let (poll_directly, status_lost) = entry.tick(now, self.max_polls, self.standby_delay);
            if status_lost {
                lost.push(*host);
            }
            if poll_directly {
                directed.push((*host, entry.device.kind()));
            }
        }

        for host in lost {
            let _ = self.events.send(TrackerEvent::StatusLost { host });
        }
        for (host, kind) in directed {
            // Poll directly in case the device cannot be reached by broadcast.
            let kinds = kind.map(|kind| vec![kind]).unwrap_or(ConsoleType::ALL.to_vec());
            for kind in kinds {
                socket
                    .send_to(message.as_bytes(), (host, kind.ddp_port()))
                    .await?;
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, data: &[u8], from: IpAddr) {
        let Some(mut status) = ddp::parse_response(data) else {
            return;
        };
        status.host_ip.get_or_insert(from);

        let entry = self
            .devices
            .entry(from)
            .or_insert_with(|| TrackedDevice::new(from, true));
        if entry.record_status(status.clone(), Instant::now()) != StatusChange::Unchanged {
            let _ = self
                .events
                .send(TrackerEvent::StatusUpdated { host: from, status });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddp::parse_response;

    fn status(code: u32) -> DeviceStatus {
        let text = format!("HTTP/1.1 {code} X\nhost-id:AA\nhost-type:PS4\n");
        parse_response(text.as_bytes()).expect("status")
    }

    #[test]
    fn test_status_cleared_after_max_polls() {
        let host: IpAddr = "10.0.0.9".parse().expect("addr");
        let mut entry = TrackedDevice::new(host, true);
        let now = Instant::now();
        entry.record_status(status(200), now);

        for _ in 0..DEFAULT_MAX_POLLS {
            let (_, lost) = entry.tick(now, DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
            assert!(!lost);
        }
        let (_, lost) = entry.tick(now, DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
        assert!(lost);
        assert!(entry.device.status().is_none());
        assert_eq!(entry.poll_count, 0);
    }

    #[test]
    fn test_standby_suppresses_polls_until_backoff_elapses() {
        let host: IpAddr = "10.0.0.9".parse().expect("addr");
        let mut entry = TrackedDevice::new(host, false);
        let start = Instant::now();
        entry.record_status(status(200), start);
        entry.record_status(status(620), start);
        assert!(entry.polls_disabled);

        // Inside the backoff window nothing is polled.
        let (directed, lost) =
            entry.tick(start + Duration::from_secs(10), DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
        assert!(!directed);
        assert!(!lost);
        assert_eq!(entry.poll_count, 0);

        // After the delay polling resumes, including directed polls.
        let (directed, _) =
            entry.tick(start + DEFAULT_STANDBY_DELAY, DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
        assert!(directed);
        assert!(!entry.polls_disabled);
    }

    #[test]
    fn test_poll_reset_on_response() {
        let host: IpAddr = "10.0.0.9".parse().expect("addr");
        let mut entry = TrackedDevice::new(host, true);
        let now = Instant::now();
        entry.tick(now, DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
        entry.tick(now, DEFAULT_MAX_POLLS, DEFAULT_STANDBY_DELAY);
        assert_eq!(entry.poll_count, 2);
        entry.record_status(status(200), now);
        assert_eq!(entry.poll_count, 0);
    }
}
