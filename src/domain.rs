//! Host controllers (domains) and the ordered list tracking them.

use crate::{
    error::{Error, Result},
    sysfs,
    udev::DeviceHandle,
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
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
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// The security level the host controller advertises. It decides which
/// authorization semantics are available for attached devices.
pub enum Security {
    /// Devices are authorized automatically by the firmware.
    None,

    /// Devices need to be authorized by the user.
    User,

    /// Like `user`, but the device must additionally match the stored key.
    Secure,

    /// Only DisplayPort tunnels are established.
    DpOnly,

    /// Only a PCIe tunnel to the first-level USB controller is created.
    UsbOnly,

    /// The level could not be determined.
    Unknown,
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// One host controller, the root of a tree of attached devices.
pub struct Domain {
    #[get = "pub"]
    /// Persistent identity of the controller.
    uid: String,

    #[get = "pub"]
    /// The sysfs name, e.g. `domain0`.
    id: String,

    #[get = "pub"]
    /// Current sysfs location.
    syspath: PathBuf,

    #[get_copy = "pub"]
    /// Advertised security level.
    security: Security,

    #[get = "pub"]
    #[builder(default)]
    /// The boot ACL slot array, if the controller supports one. The slot
    /// count is fixed at first observation; empty strings are free slots.
    bootacl: Option<Vec<String>>,

    #[get_copy = "pub"]
    /// List order key parsed from the trailing digits of `id`; -1 when the
    /// id carries no number.
    sort: i32,

    #[get_copy = "pub"]
    #[builder(default)]
    /// Whether a persisted record for this domain exists in the store.
    stored: bool,
}

/// Parse the trailing digits of a sysfs name into a sort key.
fn parse_sort(id: &str) -> i32 {
    let start = id
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);

    id[start..].parse().unwrap_or(-1)
}

impl Domain {
    /// Build a domain from a udev handle. The handle must refer to a host
    /// controller with a known security level.
    pub fn new_from_udev(dev: &dyn DeviceHandle, uid: &str) -> Result<Domain> {
        if !dev.is_domain() {
            return Err(Error::Udev(format!(
                "device '{}' is not a domain",
                dev.sysname()
            )));
        }

        let id = dev.sysname().to_string();
        let sort = parse_sort(&id);

        let security = dev
            .attribute("security")
            .ok_or_else(|| Error::Udev(format!("no security level for '{}'", id)))?;
        let security = Security::from_str(&security).unwrap_or(Security::Unknown);

        if security == Security::Unknown {
            return Err(Error::Udev(format!(
                "unknown security level for '{}'",
                id
            )));
        }

        let bootacl = match sysfs::read_attr_strv(dev, "boot_acl") {
            Ok(acl) => Some(acl),
            Err(e) if e.is_not_found() => {
                warn!("Domain '{}' has no boot ACL support", id);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Domain {
            uid: uid.to_string(),
            id,
            syspath: dev.syspath().to_path_buf(),
            security,
            bootacl,
            sort,
            stored: false,
        })
    }

    /// Mark whether the domain has a persisted record.
    pub fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    /// True iff the controller exposes a boot ACL.
    pub fn supports_bootacl(&self) -> bool {
        self.bootacl.is_some()
    }

    /// Total and free slot counts of the boot ACL.
    pub fn bootacl_slots(&self) -> (usize, usize) {
        match &self.bootacl {
            None => (0, 0),
            Some(acl) => {
                let free = acl.iter().filter(|s| s.is_empty()).count();
                (acl.len(), free)
            }
        }
    }

    /// Membership test for one device uid.
    pub fn bootacl_contains(&self, uuid: &str) -> bool {
        self.bootacl
            .as_ref()
            .map_or(false, |acl| acl.iter().any(|s| s == uuid))
    }

    /// The non-empty slots, densely packed in slot order.
    pub fn bootacl_used(&self) -> Vec<&str> {
        self.bootacl
            .as_ref()
            .map(|acl| {
                acl.iter()
                    .filter(|s| !s.is_empty())
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-read the boot ACL from sysfs. A bytewise identical ACL is a
    /// no-op; a changed one is swapped in and reported as changed. The slot
    /// count is an invariant, so a resize is rejected.
    pub fn update_from_sysfs(&mut self, dev: &dyn DeviceHandle) -> Result<bool> {
        let acl = match sysfs::read_attr_strv(dev, "boot_acl") {
            Ok(acl) => acl,
            Err(e) if e.is_not_found() => {
                if self.bootacl.is_some() {
                    warn!("Boot ACL attribute disappeared for '{}'", self.id);
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match &self.bootacl {
            None => {
                self.bootacl = Some(acl);
                Ok(true)
            }
            Some(old) if *old == acl => Ok(false),
            Some(old) if old.len() != acl.len() => Err(Error::Failed(format!(
                "boot ACL slot count changed for '{}' ({} != {})",
                self.id,
                old.len(),
                acl.len()
            ))),
            Some(_) => {
                self.bootacl = Some(acl);
                Ok(true)
            }
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.uid)
    }
}

#[derive(Debug, Default)]
/// All known domains, ordered by descending sort key. New entries go before
/// the first strictly smaller one; ties append after their equals.
pub struct DomainList {
    domains: Vec<Domain>,
}

impl DomainList {
    /// Insert a domain at its ordered position and return that position.
    pub fn insert(&mut self, domain: Domain) -> usize {
        let pos = self
            .domains
            .iter()
            .position(|d| d.sort() < domain.sort())
            .unwrap_or_else(|| self.domains.len());

        self.domains.insert(pos, domain);
        pos
    }

    /// Remove the domain with the given sysfs id.
    pub fn remove_id(&mut self, id: &str) -> Option<Domain> {
        let pos = self.domains.iter().position(|d| d.id() == id)?;
        Some(self.domains.remove(pos))
    }

    /// Find a domain by sysfs id.
    pub fn find_id(&self, id: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.id() == id)
    }

    /// Find a domain by sysfs id, mutably.
    pub fn find_id_mut(&mut self, id: &str) -> Option<&mut Domain> {
        self.domains.iter_mut().find(|d| d.id() == id)
    }

    /// Find a domain by uid.
    pub fn find_uid(&self, uid: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.uid() == uid)
    }

    pub fn get(&self, index: usize) -> Option<&Domain> {
        self.domains.get(index)
    }

    /// The domain after `index` in list order.
    pub fn next(&self, index: usize) -> Option<&Domain> {
        self.domains.get(index + 1)
    }

    /// The domain before `index` in list order.
    pub fn prev(&self, index: usize) -> Option<&Domain> {
        index.checked_sub(1).and_then(|i| self.domains.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn clear(&mut self) {
        self.domains.clear();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::udev::tests::MockDevice;
    use anyhow::Result;

    pub fn mock_domain(sysname: &str, uid: &str) -> MockDevice {
        MockDevice::new(
            &format!("/sys/bus/tb/{}", sysname),
            crate::udev::DEVTYPE_DOMAIN,
        )
        .with_attr("unique_id", uid)
        .with_attr("security", "secure")
    }

    fn domain(sysname: &str, uid: &str) -> Result<Domain> {
        Ok(Domain::new_from_udev(&mock_domain(sysname, uid), uid)?)
    }

    #[test]
    fn security_from_string() -> Result<()> {
        assert_eq!(Security::from_str("none")?, Security::None);
        assert_eq!(Security::from_str("user")?, Security::User);
        assert_eq!(Security::from_str("secure")?, Security::Secure);
        assert_eq!(Security::from_str("dponly")?, Security::DpOnly);
        assert_eq!(Security::from_str("usbonly")?, Security::UsbOnly);
        assert!(Security::from_str("fortified").is_err());
        Ok(())
    }

    #[test]
    fn sort_key_from_sysname() {
        assert_eq!(parse_sort("domain0"), 0);
        assert_eq!(parse_sort("domain2"), 2);
        assert_eq!(parse_sort("domain10"), 10);
        assert_eq!(parse_sort("domain"), -1);
        assert_eq!(parse_sort(""), -1);
    }

    #[test]
    fn new_from_udev_requires_domain_handle() {
        let dev = MockDevice::new("/sys/bus/tb/0-1", crate::udev::DEVTYPE_DEVICE)
            .with_attr("security", "secure");
        assert!(Domain::new_from_udev(&dev, "uid-d").is_err());
    }

    #[test]
    fn new_from_udev_rejects_unknown_security() {
        let dev = mock_domain("domain0", "uid-d").with_attr("security", "whatever");
        assert!(Domain::new_from_udev(&dev, "uid-d").is_err());
    }

    #[test]
    fn list_is_sorted_descending() -> Result<()> {
        let mut list = DomainList::default();
        list.insert(domain("domain2", "uid-2")?);
        list.insert(domain("domain0", "uid-0")?);
        list.insert(domain("domain10", "uid-10")?);

        let sorts: Vec<i32> = list.iter().map(|d| d.sort()).collect();
        assert_eq!(sorts, vec![10, 2, 0]);

        // Ties append after their equals.
        let mut other = domain("domain2", "uid-2b")?;
        other.set_stored(true);
        list.insert(other);

        let uids: Vec<&str> = list.iter().map(|d| d.uid().as_str()).collect();
        assert_eq!(uids, vec!["uid-10", "uid-2", "uid-2b", "uid-0"]);
        Ok(())
    }

    #[test]
    fn list_lookup_and_removal() -> Result<()> {
        let mut list = DomainList::default();
        list.insert(domain("domain0", "uid-0")?);
        list.insert(domain("domain1", "uid-1")?);

        assert_eq!(list.len(), 2);
        assert_eq!(list.find_id("domain0").map(|d| d.uid().as_str()), Some("uid-0"));
        assert_eq!(list.find_uid("uid-1").map(|d| d.id().as_str()), Some("domain1"));
        assert!(list.find_id("domain9").is_none());

        assert_eq!(list.next(0).map(|d| d.id().as_str()), Some("domain0"));
        assert_eq!(list.prev(1).map(|d| d.id().as_str()), Some("domain1"));
        assert!(list.prev(0).is_none());

        let removed = list.remove_id("domain1").unwrap();
        assert_eq!(removed.uid(), "uid-1");
        assert_eq!(list.len(), 1);

        list.clear();
        assert!(list.is_empty());
        Ok(())
    }

    #[test]
    fn bootacl_slot_accounting() -> Result<()> {
        let dev = mock_domain("domain0", "uid-d").with_attr("boot_acl", "uid-a,,uid-b,");
        let dom = Domain::new_from_udev(&dev, "uid-d")?;

        assert!(dom.supports_bootacl());
        assert_eq!(dom.bootacl_slots(), (4, 2));
        assert!(dom.bootacl_contains("uid-a"));
        assert!(!dom.bootacl_contains("uid-c"));
        assert_eq!(dom.bootacl_used(), vec!["uid-a", "uid-b"]);
        Ok(())
    }

    #[test]
    fn missing_bootacl_is_unsupported() -> Result<()> {
        let dom = domain("domain0", "uid-d")?;

        assert!(!dom.supports_bootacl());
        assert_eq!(dom.bootacl_slots(), (0, 0));
        assert!(dom.bootacl_used().is_empty());
        Ok(())
    }

    #[test]
    fn bootacl_update_semantics() -> Result<()> {
        let dev = mock_domain("domain0", "uid-d").with_attr("boot_acl", "uid-a,,uid-b");
        let mut dom = Domain::new_from_udev(&dev, "uid-d")?;

        // Same contents: no change notification.
        assert!(!dom.update_from_sysfs(&dev)?);

        // One slot changed: exactly one change.
        let changed = mock_domain("domain0", "uid-d").with_attr("boot_acl", "uid-a,uid-z,uid-b");
        assert!(dom.update_from_sysfs(&changed)?);
        assert!(dom.bootacl_contains("uid-z"));

        // A resize violates the fixed slot count.
        let resized = mock_domain("domain0", "uid-d").with_attr("boot_acl", "uid-a,uid-z");
        assert!(dom.update_from_sysfs(&resized).is_err());
        assert_eq!(dom.bootacl_slots(), (3, 0));
        Ok(())
    }
}
