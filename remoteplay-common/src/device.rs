//! Discovered console devices.

use std::net::IpAddr;

use log::debug;

use crate::{
    ConsoleType,
    ddp::{DeviceStatus, STATUS_OK, STATUS_STANDBY},
};

/// What a status update meant for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Unchanged,
    Changed,
    /// The device went from powered on to standby.
    WentToStandby,
}

/// Identity and last observed status of a console on the network.
#[derive(Debug, Clone)]
pub struct Device {
    host: IpAddr,
    kind: Option<ConsoleType>,
    host_id: Option<String>,
    name: Option<String>,
    status: Option<DeviceStatus>,
}

impl Device {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            kind: None,
            host_id: None,
            name: None,
            status: None,
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Console generation, once a status identified it.
    pub fn kind(&self) -> Option<ConsoleType> {
        self.kind
    }

    /// Hardware identifier (MAC) reported by the device.
    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> Option<&DeviceStatus> {
        self.status.as_ref()
    }

    pub fn is_on(&self) -> bool {
        self.status.as_ref().is_some_and(DeviceStatus::is_ok)
    }

    pub fn is_standby(&self) -> bool {
        self.status.as_ref().is_some_and(DeviceStatus::is_standby)
    }

    /// Record a status update. Identity fields are captured on first sight;
    /// an OK to standby transition is reported to the caller.
    pub fn set_status(&mut self, status: Option<DeviceStatus>) -> StatusChange {
        if let Some(status) = &status {
            if self.kind.is_none() {
                self.kind = status.console_type();
            }
            if self.host_id.is_none() {
                self.host_id = status.host_id.clone();
            }
            if self.name.is_none() {
                self.name = status.host_name.clone();
            }
        }

        let old_code = self.status.as_ref().map(|status| status.code);
        let changed = self.status != status;
        self.status = status;
        if !changed {
            return StatusChange::Unchanged;
        }
        debug!("device {} status changed: {:?}", self.host, self.status);
        let new_code = self.status.as_ref().map(|status| status.code);
        if old_code == Some(STATUS_OK) && new_code == Some(STATUS_STANDBY) {
            return StatusChange::WentToStandby;
        }
        StatusChange::Changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddp::parse_response;

    fn status(code: u32) -> DeviceStatus {
        let text = format!(
            "HTTP/1.1 {code} X\nhost-id:AABBCCDDEEFF\nhost-type:PS5\nhost-name:Console\n"
        );
        parse_response(text.as_bytes()).expect("status")
    }

    #[test]
    fn test_identity_captured_once() {
        let mut device = Device::new("192.168.1.5".parse().expect("addr"));
        assert_eq!(device.set_status(Some(status(200))), StatusChange::Changed);
        assert_eq!(device.kind(), Some(ConsoleType::Ps5));
        assert_eq!(device.host_id(), Some("AABBCCDDEEFF"));
        assert!(device.is_on());
    }

    #[test]
    fn test_standby_transition_detected() {
        let mut device = Device::new("192.168.1.5".parse().expect("addr"));
        device.set_status(Some(status(200)));
        assert_eq!(device.set_status(Some(status(200))), StatusChange::Unchanged);
        assert_eq!(
            device.set_status(Some(status(620))),
            StatusChange::WentToStandby
        );
        assert!(device.is_standby());
        // Standby to lost is a plain change.
        assert_eq!(device.set_status(None), StatusChange::Changed);
    }
}
