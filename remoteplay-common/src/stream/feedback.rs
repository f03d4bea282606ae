//! Controller feedback: the periodic stick-state snapshot and the
//! edge-triggered button event ring.

use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, warn};
use num_derive::FromPrimitive;
use thiserror::Error;
use tokio::{sync::Notify, time};

use crate::{
    stop::StopToken,
    stream::{StreamHandle, packets::PacketType},
};

pub const STATE_INTERVAL_MIN: Duration = Duration::from_millis(100);
pub const STATE_INTERVAL_MAX: Duration = Duration::from_millis(200);

/// Number of most recent button events replayed in every event packet.
pub const MAX_EVENTS: usize = 5;

pub const STICK_MAX: i16 = 0x7fff;
pub const STICK_MIN: i16 = -0x7fff;

const EVENT_LEN: usize = 3;

/// Scale a stick axis from [-1.0, 1.0] to the wire range, truncating
/// toward zero and saturating at the extremes.
pub fn scale_axis(value: f32) -> i16 {
    let scaled = (f32::from(STICK_MAX) * value) as i32;
    scaled.clamp(i32::from(STICK_MIN), i32::from(STICK_MAX)) as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickState {
    pub x: i16,
    pub y: i16,
}

/// Snapshot of both sticks. X runs left to right, Y runs top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub left: StickState,
    pub right: StickState,
}

impl ControllerState {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&self.left.x.to_be_bytes());
        buf[2..4].copy_from_slice(&self.left.y.to_be_bytes());
        buf[4..6].copy_from_slice(&self.right.x.to_be_bytes());
        buf[6..8].copy_from_slice(&self.right.y.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stick {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

#[derive(Debug, Error, Clone)]
#[error("unknown button name")]
pub struct ParseButtonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Button {
    Ps = 1,
    Options = 2,
    Share = 3,
    Up = 4,
    Down = 5,
    Left = 6,
    Right = 7,
    L1 = 8,
    L2 = 9,
    L3 = 10,
    R1 = 11,
    R2 = 12,
    R3 = 13,
    Cross = 14,
    Circle = 15,
    Square = 16,
    Triangle = 17,
    Touchpad = 18,
}

impl FromStr for Button {
    type Err = ParseButtonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PS" => Ok(Self::Ps),
            "OPTIONS" => Ok(Self::Options),
            "SHARE" => Ok(Self::Share),
            "UP" => Ok(Self::Up),
            "DOWN" => Ok(Self::Down),
            "LEFT" => Ok(Self::Left),
            "RIGHT" => Ok(Self::Right),
            "L1" => Ok(Self::L1),
            "L2" => Ok(Self::L2),
            "L3" => Ok(Self::L3),
            "R1" => Ok(Self::R1),
            "R2" => Ok(Self::R2),
            "R3" => Ok(Self::R3),
            "CROSS" => Ok(Self::Cross),
            "CIRCLE" => Ok(Self::Circle),
            "SQUARE" => Ok(Self::Square),
            "TRIANGLE" => Ok(Self::Triangle),
            "TOUCHPAD" => Ok(Self::Touchpad),
            _ => Err(ParseButtonError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Press,
    Release,
    Tap,
}

/// One packed button transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackEvent {
    pub button: Button,
    pub is_active: bool,
}

impl FeedbackEvent {
    pub fn to_bytes(&self) -> [u8; EVENT_LEN] {
        [
            self.button as u8,
            if self.is_active { 0xff } else { 0x00 },
            0x00,
        ]
    }
}

struct ControllerInner {
    stick_state: ControllerState,
    last_sent: Option<ControllerState>,
    pending: Vec<FeedbackEvent>,
    event_buf: VecDeque<[u8; EVENT_LEN]>,
    sequence_state: u16,
    sequence_event: u16,
}

/// What the worker has to transmit after draining the controller.
struct Outgoing {
    state: Option<(u16, [u8; 8])>,
    events: Vec<(u16, Vec<u8>)>,
}

/// Cloneable handle feeding user input into a running session. Stick
/// changes are picked up by the periodic sender; button events are
/// flushed immediately.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Mutex<ControllerInner>>,
    wake: Arc<Notify>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                stick_state: ControllerState::default(),
                last_sent: None,
                pending: Vec::new(),
                event_buf: VecDeque::with_capacity(MAX_EVENTS),
                sequence_state: 0,
                sequence_event: 0,
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Current stick snapshot.
    pub fn stick_state(&self) -> ControllerState {
        self.inner.lock().expect("controller lock").stick_state
    }

    /// Move one axis of a stick. Values outside [-1.0, 1.0] saturate.
    pub fn stick(&self, stick: Stick, axis: Axis, value: f32) {
        let value = scale_axis(value);
        let mut inner = self.inner.lock().expect("controller lock");
        let state = match stick {
            Stick::Left => &mut inner.stick_state.left,
            Stick::Right => &mut inner.stick_state.right,
        };
        let slot = match axis {
            Axis::X => &mut state.x,
            Axis::Y => &mut state.y,
        };
        if *slot != value {
            *slot = value;
            drop(inner);
            self.wake.notify_waiters();
        }
    }

    /// Move both axes of a stick at once.
    pub fn set_stick(&self, stick: Stick, x: f32, y: f32) {
        let new = StickState {
            x: scale_axis(x),
            y: scale_axis(y),
        };
        let mut inner = self.inner.lock().expect("controller lock");
        let state = match stick {
            Stick::Left => &mut inner.stick_state.left,
            Stick::Right => &mut inner.stick_state.right,
        };
        if *state != new {
            *state = new;
            drop(inner);
            self.wake.notify_waiters();
        }
    }

    /// Emulate a button press, release, or tap.
    pub fn button(&self, button: Button, action: ButtonAction) {
        let mut inner = self.inner.lock().expect("controller lock");
        match action {
            ButtonAction::Press => inner.pending.push(FeedbackEvent {
                button,
                is_active: true,
            }),
            ButtonAction::Release => inner.pending.push(FeedbackEvent {
                button,
                is_active: false,
            }),
            ButtonAction::Tap => {
                inner.pending.push(FeedbackEvent {
                    button,
                    is_active: true,
                });
                inner.pending.push(FeedbackEvent {
                    button,
                    is_active: false,
                });
            }
        }
        drop(inner);
        self.wake.notify_waiters();
    }

    /// Drain pending work: one event packet per queued transition (each
    /// replaying the ring of the five most recent events), plus a state
    /// packet when the sticks moved since the last send.
    fn collect_outgoing(&self) -> Outgoing {
        let mut inner = self.inner.lock().expect("controller lock");
        let mut events = Vec::new();
        let pending = std::mem::take(&mut inner.pending);
        for event in pending {
            if inner.event_buf.len() == MAX_EVENTS {
                inner.event_buf.pop_back();
            }
            inner.event_buf.push_front(event.to_bytes());
            let packet: Vec<u8> = inner.event_buf.iter().flatten().copied().collect();
            events.push((inner.sequence_event, packet));
            inner.sequence_event = inner.sequence_event.wrapping_add(1);
        }

        let state = if inner.last_sent != Some(inner.stick_state) {
            let sequence = inner.sequence_state;
            inner.sequence_state = inner.sequence_state.wrapping_add(1);
            inner.last_sent = Some(inner.stick_state);
            Some((sequence, inner.stick_state.to_bytes()))
        } else {
            None
        };

        Outgoing { state, events }
    }
}

/// Periodic sender task. Runs until the session stops.
pub(crate) async fn feedback_worker(
    controller: Controller,
    stream: StreamHandle,
    stop: StopToken,
) {
    debug!("feedback worker started");
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = controller.wake.notified() => {}
            _ = time::sleep(STATE_INTERVAL_MAX) => {}
        }
        if stop.is_stopped() {
            break;
        }

        let outgoing = controller.collect_outgoing();
        for (sequence, packet) in outgoing.events {
            if let Err(err) = stream
                .send_feedback(PacketType::FeedbackEvent, sequence, &packet)
                .await
            {
                warn!("failed to send feedback event: {err}");
            }
        }
        if let Some((sequence, state)) = outgoing.state {
            if let Err(err) = stream
                .send_feedback(PacketType::FeedbackState, sequence, &state)
                .await
            {
                warn!("failed to send stick state: {err}");
            }
        }

        // Keep the state channel below ten sends a second.
        tokio::select! {
            _ = stop.wait() => break,
            _ = time::sleep(STATE_INTERVAL_MIN) => {}
        }
    }
    debug!("feedback worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_axis() {
        assert_eq!(scale_axis(1.0), 0x7fff);
        assert_eq!(scale_axis(-1.0), -0x7fff);
        assert_eq!(scale_axis(0.5), 0x3fff);
        assert_eq!(scale_axis(0.0), 0);
        // Out-of-range input saturates.
        assert_eq!(scale_axis(3.5), 0x7fff);
        assert_eq!(scale_axis(-2.0), -0x7fff);
    }

    #[test]
    fn test_stick_updates_state() {
        let controller = Controller::new();
        controller.stick(Stick::Left, Axis::X, 1.0);
        controller.stick(Stick::Right, Axis::Y, -0.5);
        let state = controller.stick_state();
        assert_eq!(state.left.x, 0x7fff);
        assert_eq!(state.right.y, -0x3fff);
    }

    #[test]
    fn test_state_send_suppressed_when_unchanged() {
        let controller = Controller::new();
        controller.stick(Stick::Left, Axis::X, 0.25);

        let first = controller.collect_outgoing();
        assert!(first.state.is_some());

        // Setting the same value again transmits nothing.
        controller.stick(Stick::Left, Axis::X, 0.25);
        let second = controller.collect_outgoing();
        assert!(second.state.is_none());

        controller.stick(Stick::Left, Axis::X, 0.75);
        let third = controller.collect_outgoing();
        assert_eq!(third.state.unwrap().0, 1);
    }

    #[test]
    fn test_event_ring_keeps_five_most_recent() {
        let controller = Controller::new();
        let buttons = [
            Button::Up,
            Button::Down,
            Button::Left,
            Button::Right,
            Button::Cross,
            Button::Circle,
        ];
        for button in buttons {
            controller.button(button, ButtonAction::Press);
        }
        let outgoing = controller.collect_outgoing();
        assert_eq!(outgoing.events.len(), 6);

        // The sixth send evicted the oldest event (Up).
        let last = &outgoing.events[5].1;
        assert_eq!(last.len(), MAX_EVENTS * EVENT_LEN);
        assert_eq!(last[0], Button::Circle as u8);
        assert!(!last.chunks(EVENT_LEN).any(|event| event[0] == Button::Up as u8));

        // Sequence numbers are monotonic per event send.
        let sequences: Vec<u16> = outgoing.events.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_tap_queues_press_and_release() {
        let controller = Controller::new();
        controller.button(Button::Cross, ButtonAction::Tap);
        let outgoing = controller.collect_outgoing();
        assert_eq!(outgoing.events.len(), 2);
        assert_eq!(outgoing.events[0].1[0], Button::Cross as u8);
        assert_eq!(outgoing.events[0].1[1], 0xff);
        // The release replays on top of the press.
        assert_eq!(outgoing.events[1].1[1], 0x00);
        assert_eq!(outgoing.events[1].1[4], 0xff);
    }

    #[test]
    fn test_button_names_parse() {
        assert_eq!("cross".parse::<Button>().unwrap(), Button::Cross);
        assert_eq!("L3".parse::<Button>().unwrap(), Button::L3);
        assert!("pedal".parse::<Button>().is_err());
    }
}
