//! The consumed message-bus publisher interface.
//!
//! The daemon exposes one object per domain and one per device on the
//! system bus. The bus machinery itself lives outside this crate; the
//! manager only talks to the [`Publisher`] trait and a logging
//! implementation is used when no bus is connected.

use crate::{device::Device, domain::Domain};
use log::info;

/// The root of the daemon's object hierarchy on the bus.
pub const OBJECT_PATH_ROOT: &str = "/org/tbauthd";

/// The bus object path for one domain.
pub fn domain_object_path(uid: &str) -> String {
    format!("{}/domains/{}", OBJECT_PATH_ROOT, uid.replace('-', "_"))
}

/// The bus object path for one device.
pub fn device_object_path(uid: &str) -> String {
    format!("{}/devices/{}", OBJECT_PATH_ROOT, uid.replace('-', "_"))
}

/// Receives object lifecycle and property change notifications.
pub trait Publisher {
    /// A domain appeared and should be exported.
    fn domain_added(&mut self, _domain: &Domain) {}

    /// A domain disappeared and should be unexported.
    fn domain_removed(&mut self, _uid: &str) {}

    /// A domain property (e.g. the boot ACL) changed.
    fn domain_changed(&mut self, _domain: &Domain) {}

    /// A device appeared and should be exported.
    fn device_added(&mut self, _device: &Device) {}

    /// A device disappeared and should be unexported.
    fn device_removed(&mut self, _uid: &str) {}

    /// A device property (usually the status) changed.
    fn device_changed(&mut self, _device: &Device) {}
}

#[derive(Debug, Default)]
/// A publisher that only logs, used when no bus connection exists.
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn domain_added(&mut self, domain: &Domain) {
        info!(
            "Exported domain {} at {}",
            domain,
            domain_object_path(domain.uid())
        );
    }

    fn domain_removed(&mut self, uid: &str) {
        info!("Unexported domain at {}", domain_object_path(uid));
    }

    fn domain_changed(&mut self, domain: &Domain) {
        info!("Domain {} changed (bootacl)", domain);
    }

    fn device_added(&mut self, device: &Device) {
        info!(
            "Exported device {} at {}",
            device,
            device_object_path(device.uid())
        );
    }

    fn device_removed(&mut self, uid: &str) {
        info!("Unexported device at {}", device_object_path(uid));
    }

    fn device_changed(&mut self, device: &Device) {
        info!("Device {} is now {}", device, device.status());
    }
}
