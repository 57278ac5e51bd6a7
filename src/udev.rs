//! The consumed udev interface: hot-plug events and device handles.
//!
//! The daemon does not talk to libudev directly. It consumes events from a
//! monitor that delivers them over a channel, and reads device attributes
//! through the [`DeviceHandle`] trait. A sysfs-backed handle implementation
//! is provided for startup enumeration and for tests.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};
use strum::{AsRefStr, Display, EnumString};

/// The device type udev reports for a host controller.
pub const DEVTYPE_DOMAIN: &str = "thunderbolt_domain";

/// The device type udev reports for a peripheral.
pub const DEVTYPE_DEVICE: &str = "thunderbolt_device";

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// The udev event action.
pub enum Action {
    Add,
    Change,
    Remove,
}

/// A handle to one device as seen by udev, supporting attribute reads.
pub trait DeviceHandle: Send {
    /// The sysfs path of the device.
    fn syspath(&self) -> &Path;

    /// The sysfs name, i.e. the last path component.
    fn sysname(&self) -> &str;

    /// Read a sysfs attribute as a trimmed string.
    fn attribute(&self, name: &str) -> Option<String>;

    /// The udev device type, if known.
    fn devtype(&self) -> Option<String>;

    /// True iff the handle refers to a host controller.
    fn is_domain(&self) -> bool {
        self.devtype().as_deref() == Some(DEVTYPE_DOMAIN)
    }
}

/// One hot-plug event as delivered by the monitor.
pub struct UdevEvent {
    pub action: Action,
    pub device: Box<dyn DeviceHandle>,
}

impl UdevEvent {
    pub fn new<D: DeviceHandle + 'static>(action: Action, device: D) -> Self {
        Self {
            action,
            device: Box::new(device),
        }
    }
}

/// Sending half handed to the monitor that produces events.
#[derive(Clone)]
pub struct UdevSender(Sender<UdevEvent>);

impl UdevSender {
    /// Deliver one event. Returns an `udev` error when the daemon side is
    /// gone.
    pub fn send(&self, event: UdevEvent) -> Result<()> {
        self.0
            .send(event)
            .map_err(|_| Error::Udev("event receiver is gone".into()))
    }
}

/// Receiving half owned by the daemon.
pub struct UdevSource {
    rx: Receiver<UdevEvent>,
}

impl UdevSource {
    /// Create a connected sender/source pair.
    pub fn channel() -> (UdevSender, UdevSource) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (UdevSender(tx), UdevSource { rx })
    }

    /// Block until the next event arrives. `None` once all senders are gone.
    pub fn recv(&self) -> Option<UdevEvent> {
        self.rx.recv().ok()
    }
}

#[derive(Clone, Debug)]
/// A [`DeviceHandle`] that reads attributes straight from a sysfs directory.
pub struct SysfsDevice {
    syspath: PathBuf,
    sysname: String,
}

impl SysfsDevice {
    pub fn new<P: Into<PathBuf>>(syspath: P) -> Result<Self> {
        let syspath = syspath.into();
        let sysname = syspath
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::Udev(format!("no sysname in path {}", syspath.display()))
            })?;

        Ok(Self { syspath, sysname })
    }
}

impl DeviceHandle for SysfsDevice {
    fn syspath(&self) -> &Path {
        &self.syspath
    }

    fn sysname(&self) -> &str {
        &self.sysname
    }

    fn attribute(&self, name: &str) -> Option<String> {
        let path = self.syspath.join(name);
        fs::read_to_string(path)
            .ok()
            .map(|v| v.trim_end_matches(&['\n', '\0'][..]).to_string())
    }

    fn devtype(&self) -> Option<String> {
        // DEVTYPE is part of the uevent file, one KEY=value pair per line.
        let uevent = self.attribute("uevent")?;
        uevent
            .lines()
            .find_map(|l| l.strip_prefix("DEVTYPE="))
            .map(str::to_owned)
    }
}

/// Enumerate the devices currently registered on the bus, delivering one
/// `add` event per entry. Used at startup before the monitor takes over.
pub fn enumerate<P: AsRef<Path>>(bus_path: P, tx: &UdevSender) -> Result<usize> {
    let bus_path = bus_path.as_ref();
    let entries = match fs::read_dir(bus_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "Cannot enumerate bus path {}: {}",
                bus_path.display(),
                e
            );
            return Ok(0);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    paths.sort();

    let mut count = 0;
    for path in paths {
        let device = SysfsDevice::new(&path)?;
        debug!("Enumerated {}", device.syspath().display());
        tx.send(UdevEvent::new(Action::Add, device))?;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// An in-memory device handle for unit tests.
    #[derive(Clone, Debug, Default)]
    pub struct MockDevice {
        pub syspath: PathBuf,
        pub sysname: String,
        pub devtype: Option<String>,
        pub attributes: HashMap<String, String>,
    }

    impl MockDevice {
        pub fn new(syspath: &str, devtype: &str) -> Self {
            let syspath = PathBuf::from(syspath);
            let sysname = syspath
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            Self {
                syspath,
                sysname,
                devtype: Some(devtype.into()),
                attributes: HashMap::new(),
            }
        }

        pub fn with_attr(mut self, name: &str, value: &str) -> Self {
            self.attributes.insert(name.into(), value.into());
            self
        }
    }

    impl DeviceHandle for MockDevice {
        fn syspath(&self) -> &Path {
            &self.syspath
        }

        fn sysname(&self) -> &str {
            &self.sysname
        }

        fn attribute(&self, name: &str) -> Option<String> {
            self.attributes.get(name).cloned()
        }

        fn devtype(&self) -> Option<String> {
            self.devtype.clone()
        }
    }

    #[test]
    fn action_from_string() -> Result<()> {
        use std::str::FromStr;

        assert_eq!(Action::from_str("add")?, Action::Add);
        assert_eq!(Action::from_str("change")?, Action::Change);
        assert_eq!(Action::from_str("remove")?, Action::Remove);
        assert!(Action::from_str("bind").is_err());
        Ok(())
    }

    #[test]
    fn sysfs_device_reads_attributes() -> Result<()> {
        let dir = TempDir::new()?;
        let dev_path = dir.path().join("0-1");
        std::fs::create_dir(&dev_path)?;
        std::fs::write(dev_path.join("unique_id"), "abcd-efgh\n")?;
        std::fs::write(dev_path.join("uevent"), "DEVTYPE=thunderbolt_device\n")?;

        let dev = SysfsDevice::new(&dev_path)?;
        assert_eq!(dev.sysname(), "0-1");
        assert_eq!(dev.attribute("unique_id").as_deref(), Some("abcd-efgh"));
        assert_eq!(dev.devtype().as_deref(), Some(DEVTYPE_DEVICE));
        assert!(!dev.is_domain());
        assert!(dev.attribute("missing").is_none());
        Ok(())
    }

    #[test]
    fn enumerate_delivers_add_events() -> Result<()> {
        let dir = TempDir::new()?;
        for name in &["domain0", "0-0", "0-1"] {
            std::fs::create_dir(dir.path().join(name))?;
        }

        let (tx, source) = UdevSource::channel();
        let n = enumerate(dir.path(), &tx)?;
        assert_eq!(n, 3);

        let first = source.recv().unwrap();
        assert_eq!(first.action, Action::Add);
        assert_eq!(first.device.sysname(), "0-0");
        Ok(())
    }

    #[test]
    fn enumerate_missing_bus_is_empty() -> Result<()> {
        let (tx, _source) = UdevSource::channel();
        let n = enumerate("/nonexistent/bus/path", &tx)?;
        assert_eq!(n, 0);
        Ok(())
    }
}
