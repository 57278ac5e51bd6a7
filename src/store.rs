//! The on-disk identity store for devices and domains.
//!
//! Layout below the store root (created `0700`):
//!
//! ```text
//! <root>/version        layout version
//! <root>/devices/<uid>  per-device settings
//! <root>/domains/<uid>  per-domain settings
//! <root>/journal        the mutation journal
//! ```
//!
//! Every mutation of the persisted device set is reflected in the journal
//! before the call returns, so a restart can reconstruct what changed while
//! the daemon was not running.

use crate::{
    config::Policy,
    domain::Security,
    error::{Error, Result},
    journal::{Journal, Op},
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// The version of the on-disk layout.
pub const STORE_VERSION: u64 = 1;

#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[builder(pattern = "owned", setter(into))]
/// The persisted settings of one device.
pub struct DeviceEntry {
    #[get_copy = "pub"]
    /// The authorization policy for this device.
    policy: Policy,

    #[get_copy = "pub"]
    #[builder(default)]
    /// Generation counter for the key material.
    keygen: u32,

    #[get_copy = "pub"]
    #[builder(default = "unix_now()")]
    /// Creation time, seconds since the epoch.
    created: u64,
}

impl DeviceEntry {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            keygen: 0,
            created: unix_now(),
        }
    }
}

#[derive(
    Builder, Clone, CopyGetters, Debug, Deserialize, Eq, Getters, PartialEq, Serialize,
)]
#[builder(pattern = "owned", setter(into))]
/// The persisted state of one domain.
pub struct DomainEntry {
    #[get_copy = "pub"]
    /// The security level observed for the controller.
    security: Security,

    #[get = "pub"]
    #[builder(default)]
    /// The boot ACL in slot order, empty strings for free slots.
    bootacl: Vec<String>,
}

impl DomainEntry {
    pub fn new(security: Security, bootacl: Vec<String>) -> Self {
        Self { security, bootacl }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct DeviceDocument {
    device: DeviceEntry,
}

#[derive(Debug, Deserialize, Serialize)]
struct DomainDocument {
    domain: DomainEntry,
}

/// The store over one root directory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    journal: Journal,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Store {
    /// Open the store, creating the layout if necessary.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Store> {
        let root = root.as_ref().to_path_buf();

        for dir in &[root.clone(), root.join("devices"), root.join("domains")] {
            if !dir.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)
                    .map_err(|e| {
                        Error::io(format!("create store directory {}", dir.display()), e)
                    })?;
            }
        }

        let version_path = root.join("version");
        if version_path.exists() {
            let raw = fs::read_to_string(&version_path)
                .map_err(|e| Error::io("read store version", e))?;
            let version: u64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::Failed(format!("invalid store version: {}", raw.trim())))?;

            if version != STORE_VERSION {
                return Err(Error::Failed(format!(
                    "unsupported store version: {}",
                    version
                )));
            }
        } else {
            fs::write(&version_path, format!("{}\n", STORE_VERSION))
                .map_err(|e| Error::io("write store version", e))?;
        }

        let journal = Journal::open(&root, "journal")?;

        trace!("Opened store at {}", root.display());
        Ok(Store { root, journal })
    }

    /// The root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The journal mediating the device set mutations.
    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    fn device_path(&self, uid: &str) -> PathBuf {
        self.root.join("devices").join(uid)
    }

    fn domain_path(&self, uid: &str) -> PathBuf {
        self.root.join("domains").join(uid)
    }

    /// True iff a record for the device exists.
    pub fn has_device(&self, uid: &str) -> bool {
        self.device_path(uid).exists()
    }

    /// Read one device record; absence is `Ok(None)`.
    pub fn get_device(&self, uid: &str) -> Result<Option<DeviceEntry>> {
        read_document(&self.device_path(uid)).map(|doc| doc.map(|d: DeviceDocument| d.device))
    }

    /// Write one device record and journal the mutation. A record that
    /// already existed is stamped as unchanged, a new one as added.
    pub fn put_device(&mut self, uid: &str, entry: &DeviceEntry) -> Result<()> {
        let existed = self.has_device(uid);

        let doc = DeviceDocument {
            device: entry.clone(),
        };
        write_document(&self.device_path(uid), &doc)?;

        let op = if existed { Op::Unchanged } else { Op::Added };
        self.journal.put(uid, op)?;

        debug!("Stored device '{}' (policy: {})", uid, entry.policy());
        Ok(())
    }

    /// Delete one device record and journal the removal. Deleting an absent
    /// record is a `not-found` error.
    pub fn del_device(&mut self, uid: &str) -> Result<()> {
        let path = self.device_path(uid);

        fs::remove_file(&path)
            .map_err(|e| Error::io(format!("device record '{}'", uid), e))?;

        self.journal.put(uid, Op::Removed)?;

        debug!("Deleted device record '{}'", uid);
        Ok(())
    }

    /// Load all persisted device records and replay the journal as an
    /// integrity check: disagreements between the journal tail and the
    /// directory contents are warned about, never fatal.
    pub fn load_devices(&mut self) -> Result<Vec<(String, DeviceEntry)>> {
        let dir = self.root.join("devices");
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::io(format!("list store directory {}", dir.display()), e))?;

        let mut devices = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let uid = entry.file_name().to_string_lossy().to_string();

            match self.get_device(&uid) {
                Ok(Some(device)) => devices.push((uid, device)),
                Ok(None) => (),
                Err(e) => warn!("Skipping unreadable device record '{}': {}", uid, e),
            }
        }

        let on_disk: HashSet<String> = devices.iter().map(|(uid, _)| uid.clone()).collect();
        self.verify_journal(&on_disk)?;

        Ok(devices)
    }

    /// Read one domain record; absence is `Ok(None)`.
    pub fn get_domain(&self, uid: &str) -> Result<Option<DomainEntry>> {
        read_document(&self.domain_path(uid)).map(|doc| doc.map(|d: DomainDocument| d.domain))
    }

    /// Write one domain record.
    pub fn put_domain(&mut self, uid: &str, entry: &DomainEntry) -> Result<()> {
        let doc = DomainDocument {
            domain: entry.clone(),
        };
        write_document(&self.domain_path(uid), &doc)?;

        debug!("Stored domain '{}'", uid);
        Ok(())
    }

    /// Delete one domain record. Absence is a `not-found` error.
    pub fn del_domain(&mut self, uid: &str) -> Result<()> {
        let path = self.domain_path(uid);

        fs::remove_file(&path)
            .map_err(|e| Error::io(format!("domain record '{}'", uid), e))?;

        debug!("Deleted domain record '{}'", uid);
        Ok(())
    }

    /// Update a stored domain whose boot ACL drifted while the daemon was
    /// not running. The device additions and removals implied by the drift
    /// are journaled atomically, then the record is rewritten.
    pub fn update_domain_bootacl(
        &mut self,
        uid: &str,
        entry: &DomainEntry,
        diff: &BTreeMap<String, Op>,
    ) -> Result<()> {
        if !diff.is_empty() {
            self.journal.put_diff(diff)?;
        }

        self.put_domain(uid, entry)
    }

    fn verify_journal(&mut self, on_disk: &HashSet<String>) -> Result<()> {
        let mut last: BTreeMap<String, Op> = BTreeMap::new();
        for entry in self.journal.list()? {
            last.insert(entry.uid, entry.op);
        }

        for (uid, op) in &last {
            match op {
                Op::Added if !on_disk.contains(uid) => {
                    warn!("Journal lists '{}' as added but no record exists", uid)
                }
                Op::Removed if on_disk.contains(uid) => {
                    warn!("Journal lists '{}' as removed but a record exists", uid)
                }
                _ => (),
            }
        }

        Ok(())
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("read record {}", path.display()), e)),
    };

    let doc = toml::from_str(&raw)
        .map_err(|e| Error::Failed(format!("parse record {}: {}", path.display(), e)))?;

    Ok(Some(doc))
}

fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let body =
        toml::to_string(doc).map_err(|e| Error::Failed(format!("serialize record: {}", e)))?;

    // Write-then-rename keeps the record readable when the write is
    // interrupted.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).map_err(|e| Error::io(format!("write record {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::io(format!("rename record {}", path.display()), e))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn open_creates_versioned_layout() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("store");
        Store::open(&root)?;

        for sub in &["devices", "domains"] {
            let meta = fs::metadata(root.join(sub))?;
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        }

        assert_eq!(fs::read_to_string(root.join("version"))?.trim(), "1");
        assert!(root.join("journal").exists());
        Ok(())
    }

    #[test]
    fn open_rejects_unknown_version() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("store");
        Store::open(&root)?;

        fs::write(root.join("version"), "99\n")?;
        assert!(Store::open(&root).is_err());
        Ok(())
    }

    #[test]
    fn device_record_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = Store::open(dir.path())?;

        assert!(!store.has_device("uid-a"));
        assert!(store.get_device("uid-a")?.is_none());

        let entry = DeviceEntry::new(Policy::Auto);
        store.put_device("uid-a", &entry)?;

        assert!(store.has_device("uid-a"));
        let read = store.get_device("uid-a")?.unwrap();
        assert_eq!(read, entry);

        store.del_device("uid-a")?;
        assert!(!store.has_device("uid-a"));

        let err = store.del_device("uid-a").unwrap_err();
        assert!(err.is_not_found());

        let ops: Vec<Op> = store.journal_mut().list()?.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![Op::Added, Op::Removed]);
        Ok(())
    }

    #[test]
    fn rewriting_a_record_stamps_unchanged() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = Store::open(dir.path())?;

        store.put_device("uid-a", &DeviceEntry::new(Policy::Auto))?;
        store.put_device("uid-a", &DeviceEntry::new(Policy::Manual))?;

        let ops: Vec<Op> = store.journal_mut().list()?.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![Op::Added, Op::Unchanged]);

        assert_eq!(
            store.get_device("uid-a")?.unwrap().policy(),
            Policy::Manual
        );
        Ok(())
    }

    #[test]
    fn load_devices_returns_all_records() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = Store::open(dir.path())?;

        store.put_device("uid-a", &DeviceEntry::new(Policy::Auto))?;
        store.put_device("uid-b", &DeviceEntry::new(Policy::Manual))?;

        // A record that vanished behind the journal's back only warns.
        fs::remove_file(dir.path().join("devices").join("uid-b"))?;

        let mut devices = store.load_devices()?;
        devices.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].0, "uid-a");
        assert_eq!(devices[0].1.policy(), Policy::Auto);
        Ok(())
    }

    #[test]
    fn domain_record_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = Store::open(dir.path())?;

        let entry = DomainEntry::new(
            Security::Secure,
            vec!["uid-a".into(), "".into(), "uid-b".into()],
        );
        store.put_domain("uid-d", &entry)?;

        let read = store.get_domain("uid-d")?.unwrap();
        assert_eq!(read, entry);

        store.del_domain("uid-d")?;
        assert!(store.get_domain("uid-d")?.is_none());
        Ok(())
    }

    #[test]
    fn bootacl_drift_is_journaled() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = Store::open(dir.path())?;

        let entry = DomainEntry::new(Security::Secure, vec!["uid-new".into(), "".into()]);

        let mut diff = BTreeMap::new();
        diff.insert("uid-new".to_string(), Op::Added);
        diff.insert("uid-old".to_string(), Op::Removed);
        store.update_domain_bootacl("uid-d", &entry, &diff)?;

        let entries = store.journal_mut().list()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uid, "uid-new");
        assert_eq!(entries[0].op, Op::Added);
        assert_eq!(entries[1].uid, "uid-old");
        assert_eq!(entries[1].op, Op::Removed);

        assert_eq!(store.get_domain("uid-d")?.unwrap(), entry);
        Ok(())
    }

    #[test]
    fn entry_builders() -> Result<()> {
        let device = DeviceEntryBuilder::default()
            .policy(Policy::Manual)
            .keygen(2u32)
            .build()?;
        assert_eq!(device.policy(), Policy::Manual);
        assert_eq!(device.keygen(), 2);
        assert!(device.created() > 0);

        let domain = DomainEntryBuilder::default()
            .security(Security::User)
            .build()?;
        assert!(domain.bootacl().is_empty());
        Ok(())
    }
}
