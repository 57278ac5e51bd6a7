use anyhow::Result;
use std::{env, fs, path::PathBuf};
use tempfile::TempDir;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    env::set_var("RUST_LOG", "debug");
    env_logger::init();
}

/// A fake sysfs bus directory the daemon can enumerate and authorize
/// against.
pub struct FakeBus {
    root: TempDir,
}

impl FakeBus {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// Create a host controller entry and return its directory.
    pub fn add_domain(&self, sysname: &str, uid: &str, security: &str) -> Result<PathBuf> {
        let dir = self.path().join(sysname);
        fs::create_dir_all(&dir)?;

        fs::write(dir.join("uevent"), "DEVTYPE=thunderbolt_domain\n")?;
        fs::write(dir.join("unique_id"), format!("{}\n", uid))?;
        fs::write(dir.join("security"), format!("{}\n", security))?;
        Ok(dir)
    }

    /// Create a peripheral entry and return its directory.
    pub fn add_device(&self, sysname: &str, uid: &str) -> Result<PathBuf> {
        let dir = self.path().join(sysname);
        fs::create_dir_all(&dir)?;

        fs::write(dir.join("uevent"), "DEVTYPE=thunderbolt_device\n")?;
        fs::write(dir.join("unique_id"), format!("{}\n", uid))?;
        fs::write(dir.join("device_name"), "Integration Dock\n")?;
        fs::write(dir.join("vendor_name"), "Test Vendor\n")?;
        fs::write(dir.join("authorized"), "0\n")?;
        fs::write(dir.join("key"), "")?;
        Ok(dir)
    }

    /// Remove a device entry from the bus, as an unplug would.
    pub fn remove(&self, sysname: &str) -> Result<()> {
        fs::remove_dir_all(self.path().join(sysname))?;
        Ok(())
    }
}
