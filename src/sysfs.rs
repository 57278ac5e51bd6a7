//! Typed access to sysfs device attributes.
//!
//! Writes always go through a previously opened directory file descriptor,
//! never through a reconstructed path, so that a device directory which got
//! reused by the kernel after a fast replug cannot be confused with the
//! device it was opened for.

use crate::{
    error::{Error, Result},
    udev::DeviceHandle,
};
use log::{debug, warn};
use nix::{
    fcntl::{open, openat, OFlag},
    sys::stat::Mode,
    unistd::{close, read, write},
};
use std::{
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// A sysfs device directory, held open by file descriptor.
#[derive(Debug)]
pub struct SysfsDir {
    fd: RawFd,
    path: PathBuf,
}

/// Closes the wrapped attribute descriptor on every exit path.
struct AttrFd(RawFd);

impl Drop for AttrFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl SysfsDir {
    /// Open a device directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fd = open(
            &path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::from_nix(format!("open directory {}", path.display()), e))?;

        Ok(Self { fd, path })
    }

    /// The path this directory was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the attribute `name` below this directory as a trimmed string.
    pub fn read_attr(&self, name: &str) -> Result<String> {
        let fd = openat(
            self.fd,
            name,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::from_nix(format!("open attribute '{}'", name), e))?;
        let fd = AttrFd(fd);

        let mut data = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = read(fd.0, &mut buf)
                .map_err(|e| Error::from_nix(format!("read attribute '{}'", name), e))?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        let value = String::from_utf8_lossy(&data)
            .trim_end_matches(&['\n', '\0'][..])
            .to_string();
        Ok(value)
    }

    /// Write a single ASCII character to the attribute `name`.
    pub fn write_attr_char(&self, name: &str, value: char) -> Result<()> {
        let fd = openat(
            self.fd,
            name,
            OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::from_nix(format!("open attribute '{}'", name), e))?;
        let fd = AttrFd(fd);

        let buf = [value as u8];
        let n = write(fd.0, &buf)
            .map_err(|e| Error::from_nix(format!("write attribute '{}'", name), e))?;

        if n != 1 {
            return Err(Error::Failed(format!(
                "short write to attribute '{}'",
                name
            )));
        }

        Ok(())
    }

    /// Verify that the `unique_id` attribute below this directory matches
    /// `uid`. The kernel reuses sysfs paths after rapid replug; checking the
    /// identity at the already opened descriptor closes that race.
    pub fn verify_unique_id(&self, uid: &str) -> Result<()> {
        let actual = self.read_attr("unique_id")?;

        if actual != uid {
            return Err(Error::IdentityMismatch {
                expected: uid.to_string(),
                actual,
            });
        }

        Ok(())
    }
}

impl Drop for SysfsDir {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// Read the name variant of an attribute: `<attr>_name` is preferred, the
/// plain `<attr>` is the fallback. Absence of both is an error.
pub fn read_attr_name(dev: &dyn DeviceHandle, attr: &str) -> Result<String> {
    let named = format!("{}_name", attr);

    if let Some(v) = dev.attribute(&named) {
        return Ok(v);
    }

    dev.attribute(attr)
        .ok_or_else(|| Error::Udev(format!("failed to get sysfs attr: {}", attr)))
}

/// Read an integer attribute. Absent, unparseable or out-of-range values
/// yield 0 with a warning.
pub fn read_attr_int(dev: &dyn DeviceHandle, attr: &str) -> i32 {
    let value = match dev.attribute(attr) {
        Some(v) => v,
        None => {
            debug!("No sysfs attr '{}', using 0", attr);
            return 0;
        }
    };

    let parsed = match value.trim().parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            debug!("Unparseable value '{}' for sysfs attr '{}'", value, attr);
            return 0;
        }
    };

    if parsed > i64::from(i32::MAX) || parsed < i64::from(i32::MIN) {
        warn!("Value read from sysfs attr '{}' outside of range", attr);
        return 0;
    }

    parsed as i32
}

/// Read a comma-separated string list attribute, preserving empty slots.
/// Absence is a distinct `NotFound` outcome.
pub fn read_attr_strv(dev: &dyn DeviceHandle, attr: &str) -> Result<Vec<String>> {
    let value = dev
        .attribute(attr)
        .ok_or_else(|| Error::NotFound(format!("sysfs attr '{}'", attr)))?;

    Ok(value.split(',').map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udev::tests::MockDevice;
    use anyhow::Result;
    use std::fs;
    use tempfile::TempDir;

    fn device_dir(uid: &str) -> Result<TempDir> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("unique_id"), format!("{}\n", uid))?;
        fs::write(dir.path().join("authorized"), "0\n")?;
        Ok(dir)
    }

    #[test]
    fn read_attr_trims_newline() -> Result<()> {
        let dir = device_dir("uid-1")?;
        let sysfs = SysfsDir::open(dir.path())?;

        assert_eq!(sysfs.read_attr("unique_id")?, "uid-1");
        Ok(())
    }

    #[test]
    fn read_attr_absent_is_not_found() -> Result<()> {
        let dir = device_dir("uid-1")?;
        let sysfs = SysfsDir::open(dir.path())?;

        let err = sysfs.read_attr("nope").unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn write_attr_char_rewrites_value() -> Result<()> {
        let dir = device_dir("uid-1")?;
        let sysfs = SysfsDir::open(dir.path())?;

        sysfs.write_attr_char("authorized", '1')?;
        let value = fs::read_to_string(dir.path().join("authorized"))?;
        assert!(value.starts_with('1'));
        Ok(())
    }

    #[test]
    fn verify_unique_id_matches() -> Result<()> {
        let dir = device_dir("uid-1")?;
        let sysfs = SysfsDir::open(dir.path())?;

        sysfs.verify_unique_id("uid-1")?;

        let err = sysfs.verify_unique_id("uid-2").unwrap_err();
        match err {
            crate::error::Error::IdentityMismatch { expected, actual } => {
                assert_eq!(expected, "uid-2");
                assert_eq!(actual, "uid-1");
            }
            _ => panic!("expected identity mismatch"),
        }
        Ok(())
    }

    #[test]
    fn open_missing_directory_fails() {
        assert!(SysfsDir::open("/nonexistent/device/path").is_err());
    }

    #[test]
    fn attr_name_prefers_name_variant() -> Result<()> {
        let dev = MockDevice::new("/sys/0-1", "thunderbolt_device")
            .with_attr("device", "0x1234")
            .with_attr("device_name", "Dock Station");

        assert_eq!(read_attr_name(&dev, "device")?, "Dock Station");

        let dev = MockDevice::new("/sys/0-1", "thunderbolt_device").with_attr("vendor", "0x42");
        assert_eq!(read_attr_name(&dev, "vendor")?, "0x42");

        let dev = MockDevice::new("/sys/0-1", "thunderbolt_device");
        assert!(read_attr_name(&dev, "vendor").is_err());
        Ok(())
    }

    #[test]
    fn attr_int_defaults_to_zero() {
        let dev = MockDevice::new("/sys/0-1", "thunderbolt_device")
            .with_attr("authorized", "1")
            .with_attr("garbage", "yes")
            .with_attr("huge", "4294967296");

        assert_eq!(read_attr_int(&dev, "authorized"), 1);
        assert_eq!(read_attr_int(&dev, "garbage"), 0);
        assert_eq!(read_attr_int(&dev, "huge"), 0);
        assert_eq!(read_attr_int(&dev, "absent"), 0);
    }

    #[test]
    fn attr_strv_keeps_empty_slots() -> Result<()> {
        let dev = MockDevice::new("/sys/domain0", "thunderbolt_domain")
            .with_attr("boot_acl", "uid-a,,uid-b");

        let acl = read_attr_strv(&dev, "boot_acl")?;
        assert_eq!(acl, vec!["uid-a", "", "uid-b"]);

        let err = read_attr_strv(&dev, "missing").unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}
