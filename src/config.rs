//! Configuration related structures.

use crate::error::{Error, Result};
use bitflags::bitflags;
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, str::FromStr};
use strum::{AsRefStr, Display, EnumString};

/// The version of the daemon config file format.
pub const CONFIG_VERSION: u64 = 1;

const COMMENT_HEADER: &str = "# Generated by tbauthd - do not edit\n";

#[derive(Builder, CopyGetters, Getters, Deserialize, Parser, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[clap(
    about("tbauthd - Thunderbolt device authorization daemon"),
    version
)]
/// Config is the main configuration structure for the daemon.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("TBAUTHD_LOG_LEVEL"),
        long("log-level"),
        possible_values(["trace", "debug", "info", "warn", "error", "off"]),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(
        default_value("/var/lib/tbauthd"),
        env("TBAUTHD_STORE_PATH"),
        long("store-path"),
        value_name("PATH")
    )]
    /// The root of the identity store.
    store_path: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/etc/tbauthd/tbauthd.conf"),
        env("TBAUTHD_CONFIG_PATH"),
        long("config-path"),
        value_name("PATH")
    )]
    /// The path to the daemon configuration file.
    config_path: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/sys/bus/thunderbolt/devices"),
        env("TBAUTHD_BUS_PATH"),
        long("bus-path"),
        value_name("PATH")
    )]
    /// The sysfs bus directory enumerated at startup.
    bus_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(vec!["tbauthd"])
    }
}

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
/// The authorization policy for one stored device.
pub enum Policy {
    /// Authorize the device as soon as it is connected.
    Auto,

    /// Authorize only on explicit request.
    Manual,

    /// Follow the daemon wide default policy.
    Default,
}

impl Policy {
    /// Resolve `Default` against the daemon wide default.
    pub fn resolve(self, default: Policy) -> Policy {
        match self {
            Policy::Default => default,
            other => other,
        }
    }
}

bitflags! {
    /// Authorization mode flags of the daemon.
    pub struct AuthMode: u32 {
        /// Authorization is enabled.
        const ENABLED = 0b01;

        /// Key based (secure) authorization is preferred where available.
        const SECURE = 0b10;
    }
}

impl AuthMode {
    /// Parse a comma separated list of flag names.
    pub fn from_names(value: &str) -> Result<AuthMode> {
        let mut mode = AuthMode::empty();

        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "enabled" => mode |= AuthMode::ENABLED,
                "secure" => mode |= AuthMode::SECURE,
                _ => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown auth mode flag: {}",
                        name
                    )))
                }
            }
        }

        Ok(mode)
    }

    /// The comma separated flag names.
    pub fn to_names(self) -> String {
        let mut names = Vec::new();

        if self.contains(AuthMode::ENABLED) {
            names.push("enabled");
        }
        if self.contains(AuthMode::SECURE) {
            names.push("secure");
        }

        names.join(",")
    }
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::ENABLED
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigDocument {
    config: ConfigSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigSection {
    version: Option<u64>,

    #[serde(rename = "DefaultPolicy", skip_serializing_if = "Option::is_none")]
    default_policy: Option<String>,

    #[serde(rename = "AuthMode", skip_serializing_if = "Option::is_none")]
    auth_mode: Option<String>,
}

#[derive(Debug, Default)]
/// The key/value daemon configuration file. Values are kept as read;
/// accessors parse on demand and distinguish "absent" (`Ok(None)`) from
/// "malformed" (`Err`).
pub struct DaemonConfig {
    section: ConfigSection,
}

impl DaemonConfig {
    /// A freshly generated config carrying only the version key.
    pub fn user_init() -> DaemonConfig {
        DaemonConfig {
            section: ConfigSection {
                version: Some(CONFIG_VERSION),
                ..Default::default()
            },
        }
    }

    /// Load the config file. An absent file yields the daemon defaults, a
    /// malformed one is a `config-invalid` error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DaemonConfig> {
        let path = path.as_ref();

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DaemonConfig::default());
            }
            Err(e) => return Err(Error::io(format!("read config {}", path.display()), e)),
        };

        let doc: ConfigDocument = toml::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;

        match doc.config.version {
            Some(CONFIG_VERSION) => (),
            Some(v) => {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported config version: {}",
                    v
                )))
            }
            None => {
                return Err(Error::ConfigInvalid("missing config version".into()));
            }
        }

        Ok(DaemonConfig {
            section: doc.config,
        })
    }

    /// Write the config to disk, with the generated-file comment header.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let doc = ConfigDocument {
            config: ConfigSection {
                version: Some(CONFIG_VERSION),
                default_policy: self.section.default_policy.clone(),
                auth_mode: self.section.auth_mode.clone(),
            },
        };

        let body = toml::to_string(&doc)
            .map_err(|e| Error::Failed(format!("serialize config: {}", e)))?;

        fs::write(path, format!("{}\n{}", COMMENT_HEADER, body))
            .map_err(|e| Error::io(format!("write config {}", path.display()), e))
    }

    /// The configured default policy, if any.
    pub fn default_policy(&self) -> Result<Option<Policy>> {
        let raw = match &self.section.default_policy {
            None => return Ok(None),
            Some(raw) => raw,
        };

        let policy = Policy::from_str(raw)
            .map_err(|_| Error::ConfigInvalid(format!("invalid policy: {}", raw)))?;

        Ok(Some(policy))
    }

    /// The configured authorization mode, if any.
    pub fn auth_mode(&self) -> Result<Option<AuthMode>> {
        match &self.section.auth_mode {
            None => Ok(None),
            Some(raw) => AuthMode::from_names(raw).map(Some),
        }
    }

    /// Replace the stored authorization mode.
    pub fn set_auth_mode(&mut self, mode: AuthMode) {
        self.section.auth_mode = Some(mode.to_names());
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.store_path(), &PathBuf::from("/var/lib/tbauthd"));
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .store_path("/some/path")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(&c.store_path().display().to_string(), "/some/path");

        Ok(())
    }

    #[test]
    fn policy_resolution() {
        assert_eq!(Policy::Auto.resolve(Policy::Manual), Policy::Auto);
        assert_eq!(Policy::Default.resolve(Policy::Manual), Policy::Manual);
    }

    #[test]
    fn auth_mode_names_roundtrip() -> Result<()> {
        let mode = AuthMode::from_names("enabled,secure")?;
        assert_eq!(mode, AuthMode::ENABLED | AuthMode::SECURE);
        assert_eq!(mode.to_names(), "enabled,secure");

        assert_eq!(AuthMode::from_names("")?, AuthMode::empty());
        assert!(AuthMode::from_names("enabled,bogus").is_err());
        Ok(())
    }

    #[test]
    fn daemon_config_absent_file_is_default() -> Result<()> {
        let cfg = DaemonConfig::load("/nonexistent/tbauthd.conf")?;
        assert!(cfg.default_policy()?.is_none());
        assert!(cfg.auth_mode()?.is_none());
        Ok(())
    }

    #[test]
    fn daemon_config_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tbauthd.conf");

        let mut cfg = DaemonConfig::user_init();
        cfg.set_auth_mode(AuthMode::ENABLED | AuthMode::SECURE);
        cfg.write(&path)?;

        let raw = fs::read_to_string(&path)?;
        assert!(raw.starts_with("# Generated by tbauthd"));

        let cfg = DaemonConfig::load(&path)?;
        assert_eq!(
            cfg.auth_mode()?,
            Some(AuthMode::ENABLED | AuthMode::SECURE)
        );
        assert!(cfg.default_policy()?.is_none());
        Ok(())
    }

    #[test]
    fn daemon_config_parses_policy() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tbauthd.conf");

        fs::write(
            &path,
            "[config]\nversion = 1\nDefaultPolicy = \"manual\"\n",
        )?;
        let cfg = DaemonConfig::load(&path)?;
        assert_eq!(cfg.default_policy()?, Some(Policy::Manual));

        fs::write(
            &path,
            "[config]\nversion = 1\nDefaultPolicy = \"sometimes\"\n",
        )?;
        let cfg = DaemonConfig::load(&path)?;
        assert!(cfg.default_policy().is_err());
        Ok(())
    }

    #[test]
    fn daemon_config_checks_version() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tbauthd.conf");

        fs::write(&path, "[config]\nversion = 7\n")?;
        assert!(DaemonConfig::load(&path).is_err());

        fs::write(&path, "[config]\nDefaultPolicy = \"auto\"\n")?;
        assert!(DaemonConfig::load(&path).is_err());

        fs::write(&path, "not toml at all [")?;
        assert!(DaemonConfig::load(&path).is_err());
        Ok(())
    }
}
