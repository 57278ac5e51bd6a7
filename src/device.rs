//! The in-memory record of one attached peripheral.

use crate::{
    error::{Error, Result},
    sysfs,
    udev::DeviceHandle,
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    PartialEq,
    Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
/// The authorization status of a device. This is the state variable of the
/// authorization engine; only the engine moves a device along the edges
/// checked by [`Status::valid_transition`].
pub enum Status {
    /// Not attached. A device in this state is not in the device table.
    Disconnected,

    /// Attached but not authorized, no key material stored.
    Connected,

    /// A worker is currently writing to sysfs.
    Authorizing,

    /// Authorized at the current level, no new key established.
    Authorized,

    /// Authorized and key material was just established.
    AuthorizedNewkey,

    /// Authorized at the secure level.
    AuthorizedSecure,

    /// The last authorization attempt failed.
    AuthError,
}

impl Status {
    /// Compute the status from the `authorized` sysfs level and whether the
    /// `key` attribute is non-empty.
    pub fn from_sysfs(authorized: i32, have_key: bool) -> Status {
        if authorized == 2 {
            return Status::AuthorizedSecure;
        }

        if authorized == 1 {
            if have_key {
                return Status::AuthorizedNewkey;
            }
            return Status::Authorized;
        }

        if have_key {
            return Status::AuthError;
        }

        Status::Connected
    }

    /// True iff an authorize request is allowed in this state.
    pub fn can_authorize(self) -> bool {
        matches!(self, Status::Connected | Status::AuthError)
    }

    /// True iff the device is authorized at any level.
    pub fn is_authorized(self) -> bool {
        matches!(
            self,
            Status::Authorized | Status::AuthorizedNewkey | Status::AuthorizedSecure
        )
    }

    /// Check one edge of the authorization state machine.
    pub fn valid_transition(from: Status, to: Status) -> bool {
        match (from, to) {
            (Status::Connected, Status::Authorizing) => true,
            (Status::AuthError, Status::Authorizing) => true,
            (Status::Authorizing, Status::Authorized) => true,
            (Status::Authorizing, Status::AuthorizedNewkey) => true,
            (Status::Authorizing, Status::AuthorizedSecure) => true,
            (Status::Authorizing, Status::AuthError) => true,
            _ => false,
        }
    }
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// One peripheral attached through the bus. Exclusively owned by the
/// manager's device table; the uid never changes after creation.
pub struct Device {
    #[get = "pub"]
    /// Stable, globally unique identity provided by the device firmware.
    uid: String,

    #[get = "pub"]
    /// Human readable device name.
    name: String,

    #[get = "pub"]
    /// Human readable vendor name.
    vendor: String,

    #[get_copy = "pub"]
    /// The current authorization status.
    status: Status,

    #[get = "pub"]
    #[builder(default)]
    /// Current sysfs location; only valid while the device is attached.
    syspath: Option<PathBuf>,

    #[get_copy = "pub"]
    #[builder(default)]
    /// Set when a remove event arrived while an authorization was in
    /// flight; the table removal is deferred to the completion handler.
    pending_removal: bool,
}

impl Device {
    /// Build a device from a udev handle.
    pub fn new_from_udev(dev: &dyn DeviceHandle) -> Result<Device> {
        let uid = dev
            .attribute("unique_id")
            .ok_or_else(|| Error::Udev("could not get unique_id for device".into()))?;

        let name = sysfs::read_attr_name(dev, "device")?;
        let vendor = sysfs::read_attr_name(dev, "vendor")?;

        let authorized = sysfs::read_attr_int(dev, "authorized");
        let have_key = dev.attribute("key").map_or(false, |k| !k.is_empty());

        Ok(Device {
            uid,
            name,
            vendor,
            status: Status::from_sysfs(authorized, have_key),
            syspath: Some(dev.syspath().to_path_buf()),
            pending_removal: false,
        })
    }

    /// Refresh the transient fields from sysfs and recompute the status.
    /// Returns whether anything changed. While a worker is authorizing, the
    /// status is left alone so that only the engine moves it.
    pub fn update_from_sysfs(&mut self, dev: &dyn DeviceHandle) -> Result<bool> {
        let mut changed = false;

        if let Some(uid) = dev.attribute("unique_id") {
            if uid != self.uid {
                warn!(
                    "Ignoring unique_id change for device '{}' (read '{}')",
                    self.uid, uid
                );
            }
        }

        let syspath = Some(dev.syspath().to_path_buf());
        if self.syspath != syspath {
            self.syspath = syspath;
            changed = true;
        }

        if let Ok(name) = sysfs::read_attr_name(dev, "device") {
            if self.name != name {
                self.name = name;
                changed = true;
            }
        }

        if let Ok(vendor) = sysfs::read_attr_name(dev, "vendor") {
            if self.vendor != vendor {
                self.vendor = vendor;
                changed = true;
            }
        }

        if self.status != Status::Authorizing {
            let authorized = sysfs::read_attr_int(dev, "authorized");
            let have_key = dev.attribute("key").map_or(false, |k| !k.is_empty());
            let status = Status::from_sysfs(authorized, have_key);

            if self.status != status {
                self.status = status;
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Move the device along one edge of the state machine. Illegal edges
    /// are a `wrong-state` error and leave the status untouched.
    pub fn transition(&mut self, to: Status) -> Result<Status> {
        let from = self.status;

        if !Status::valid_transition(from, to) {
            return Err(Error::WrongState(format!(
                "cannot go from '{}' to '{}'",
                from, to
            )));
        }

        self.status = to;
        Ok(from)
    }

    /// Clear the sysfs location after an unplug.
    pub fn detach(&mut self) {
        self.syspath = None;
    }

    /// Mark the device for deferred removal (see `pending_removal`).
    pub fn set_pending_removal(&mut self, pending: bool) {
        self.pending_removal = pending;
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})", self.vendor, self.name, self.uid)
    }
}
