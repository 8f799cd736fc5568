use thiserror::Error;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::device::Technology;
use crate::ipconfig::IpConfig;

mod v1;

pub const DEFAULT_PATH: &str = "/etc/netconnd/config.toml";
pub const ENV_VAR: &str = "NETCONND_CONFIG_PATH";
/// Priority of interfaces that do not state one.
pub const DEFAULT_PRIORITY: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub resolv_conf: PathBuf,
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub technology: Technology,
    /// Lowest priority among all interfaces owns the system default route.
    pub priority: u32,
    pub fixed_ip_params: bool,
    pub ipconfig: IpConfig,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("Interface without a name")]
    MissingInterfaceName,
    #[error("Interface {0} is configured more than once")]
    DuplicateInterface(String),
}

impl Config {
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Interface that should carry the system default route, among those
    /// `available` accepts. Ties go to the interface listed first.
    pub fn default_interface(&self, available: impl Fn(&Interface) -> bool) -> Option<&Interface> {
        self.interfaces
            .iter()
            .enumerate()
            .filter(|(_, i)| available(i))
            .min_by_key(|(position, i)| (i.priority, *position))
            .map(|(_, i)| i)
    }

    fn validate(self) -> Result<Self, Error> {
        {
            let mut seen = HashSet::new();
            for interface in self.interfaces.iter() {
                if interface.name.is_empty() {
                    return Err(Error::MissingInterfaceName);
                }
                if !seen.insert(interface.name.as_str()) {
                    return Err(Error::DuplicateInterface(interface.name.clone()));
                }
            }
        }
        Ok(self)
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            let wrong_keys = v1::wrong_keys(&table);
            for key in wrong_keys.iter() {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            Config::from(res).validate()
        }
        _ => Err(Error::VersionMismatch(version)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_version_is_refused() {
        let result = parse("resolv_conf = \"/tmp/resolv.conf\"\n");
        assert!(matches!(result, Err(Error::VersionNotFound)));
    }

    #[test]
    fn unknown_version_is_refused() {
        assert!(matches!(parse("version = 7\n"), Err(Error::VersionMismatch(7))));
    }

    #[test]
    fn duplicate_interfaces_are_refused() {
        let config = r#"
version = 1
[[interface]]
name = "eth0"
[[interface]]
name = "eth0"
"#;
        assert!(matches!(parse(config), Err(Error::DuplicateInterface(name)) if name == "eth0"));
    }

    #[test]
    fn unnamed_interfaces_are_refused() {
        let config = "version = 1\n[[interface]]\ntechnology = \"wifi\"\n";
        assert!(matches!(parse(config), Err(Error::MissingInterfaceName)));
    }

    #[test]
    fn default_interface_has_lowest_priority() -> anyhow::Result<()> {
        let config = parse(
            r#"
version = 1
[[interface]]
name = "wlan0"
priority = 20
[[interface]]
name = "eth0"
priority = 10
[[interface]]
name = "eth1"
priority = 10
"#,
        )?;
        assert_eq!(config.default_interface(|_| true).map(|i| i.name.as_str()), Some("eth0"));
        let without_eth0 = config.default_interface(|i| i.name != "eth0");
        assert_eq!(without_eth0.map(|i| i.name.as_str()), Some("eth1"));
        assert!(config.default_interface(|_| false).is_none());
        assert_eq!(config.interface("wlan0").map(|i| i.priority), Some(20));
        assert!(config.interface("wwan0").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn read_reports_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = read(&dir.path().join("config.toml")).await;
        assert!(matches!(result, Err(Error::NoFile)));
        Ok(())
    }

    #[tokio::test]
    async fn read_parses_file_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "version = 1\nresolv_conf = \"/tmp/resolv.conf\"\n[[interface]]\nname = \"eth0\"\n",
        )?;
        let config = read(&path).await?;
        assert_eq!(config.resolv_conf, PathBuf::from("/tmp/resolv.conf"));
        assert_eq!(config.interfaces.len(), 1);
        Ok(())
    }
}
