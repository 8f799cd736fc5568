use serde::{Deserialize, Serialize};

use std::path::PathBuf;

use crate::config;
use crate::device::Technology;
use crate::ipconfig::IpConfig;
use crate::resolver::DEFAULT_RESOLV_CONF;

const INTERFACE_KEYS: [&str; 5] = ["name", "technology", "priority", "fixed_ip_params", "ipconfig"];
const IPCONFIG_KEYS: [&str; 18] = [
    "address_family",
    "address",
    "subnet_prefix",
    "broadcast_address",
    "peer_address",
    "gateway",
    "dns_servers",
    "domain_search",
    "domain_name",
    "mtu",
    "default_route",
    "blackhole_ipv6",
    "allowed_uids",
    "allowed_iifs",
    "blackholed_uids",
    "blackholed_addrs",
    "exclusion_list",
    "routes",
];
const ROUTE_KEYS: [&str; 3] = ["host", "prefix", "gateway"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u8,
    pub(super) resolv_conf: Option<PathBuf>,
    #[serde(default)]
    pub(super) interface: Vec<Interface>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct Interface {
    #[serde(default)]
    name: String,
    technology: Option<Technology>,
    priority: Option<u32>,
    fixed_ip_params: Option<bool>,
    ipconfig: Option<IpConfig>,
}

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        if key == "version" || key == "resolv_conf" {
            continue;
        }
        if key != "interface" {
            wrong_keys.push(key.clone());
            continue;
        }
        let Some(interfaces) = value.as_array() else {
            continue;
        };
        for (index, interface) in interfaces.iter().enumerate() {
            let Some(interface) = interface.as_table() else {
                continue;
            };
            for (k, v) in interface.iter() {
                if k == "ipconfig" {
                    ipconfig_wrong_keys(&format!("interface.{index}.ipconfig"), v, &mut wrong_keys);
                    continue;
                }
                if !INTERFACE_KEYS.contains(&k.as_str()) {
                    wrong_keys.push(format!("interface.{index}.{k}"));
                }
            }
        }
    }
    wrong_keys
}

fn ipconfig_wrong_keys(prefix: &str, value: &toml::Value, wrong_keys: &mut Vec<String>) {
    let Some(ipconfig) = value.as_table() else {
        return;
    };
    for (k, v) in ipconfig.iter() {
        if !IPCONFIG_KEYS.contains(&k.as_str()) {
            wrong_keys.push(format!("{prefix}.{k}"));
            continue;
        }
        if k != "routes" {
            continue;
        }
        // static routes are an array of tables
        let routes = v.as_array().map(|a| a.as_slice()).unwrap_or_default();
        for (index, route) in routes.iter().enumerate() {
            let Some(route) = route.as_table() else {
                continue;
            };
            for key in route.keys().filter(|key| !ROUTE_KEYS.contains(&key.as_str())) {
                wrong_keys.push(format!("{prefix}.routes.{index}.{key}"));
            }
        }
    }
}

impl From<Interface> for config::Interface {
    fn from(value: Interface) -> Self {
        config::Interface {
            name: value.name,
            technology: value.technology.unwrap_or_default(),
            priority: value.priority.unwrap_or(config::DEFAULT_PRIORITY),
            fixed_ip_params: value.fixed_ip_params.unwrap_or(false),
            ipconfig: value.ipconfig.unwrap_or_default(),
        }
    }
}

impl From<Config> for config::Config {
    fn from(value: Config) -> Self {
        config::Config {
            resolv_conf: value.resolv_conf.unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLV_CONF)),
            interfaces: value.interface.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::address::IpFamily;

    const FULL_CONFIG: &str = r#####"
version = 1
resolv_conf = "/run/netconnd/resolv.conf"

[[interface]]
name = "eth0"
technology = "ethernet"
priority = 10

[interface.ipconfig]
address_family = "ipv4"
address = "192.168.1.1"
subnet_prefix = 24
broadcast_address = "192.168.1.255"
gateway = "192.168.1.254"
dns_servers = ["8.8.8.8", "8.8.9.9"]
domain_search = ["chromium.org", "google.com"]
mtu = 1500

[[interface.ipconfig.routes]]
host = "10.8.0.0"
prefix = 16
gateway = "192.168.1.253"

[[interface]]
name = "tun0"
technology = "vpn"
priority = 5
fixed_ip_params = true

[interface.ipconfig]
address = "10.8.0.2"
subnet_prefix = 32
peer_address = "10.8.0.1"
gateway = "10.8.0.1"
default_route = false
allowed_uids = [1000]
allowed_iifs = ["arc0"]
blackholed_uids = [2000]
blackholed_addrs = ["10.1.1.1"]
blackhole_ipv6 = true
exclusion_list = ["203.0.113.7", "192.0.1.0/24"]
"#####;

    #[test]
    fn full_config() -> anyhow::Result<()> {
        let parsed = toml::from_str::<Config>(FULL_CONFIG)?;
        let config = config::Config::from(parsed);
        assert_eq!(config.resolv_conf, PathBuf::from(DEFAULT_RESOLV_CONF));
        assert_eq!(config.interfaces.len(), 2);

        let eth = &config.interfaces[0];
        assert_eq!(eth.technology, Technology::Ethernet);
        assert_eq!(eth.ipconfig.address_family, Some(IpFamily::V4));
        assert_eq!(eth.ipconfig.routes.len(), 1);
        assert!(eth.ipconfig.default_route);
        assert!(!eth.fixed_ip_params);

        let tun = &config.interfaces[1];
        assert_eq!(tun.technology, Technology::Vpn);
        assert!(tun.fixed_ip_params);
        assert!(!tun.ipconfig.default_route);
        assert!(tun.ipconfig.needs_per_device_routing());
        assert_eq!(tun.ipconfig.exclusion_list.len(), 2);
        assert!(wrong_keys(&FULL_CONFIG.parse::<toml::Table>()?).is_empty());
        Ok(())
    }

    #[test]
    fn minimal_config_uses_defaults() -> anyhow::Result<()> {
        let parsed = toml::from_str::<Config>("version = 1\n[[interface]]\nname = \"wlan0\"\n")?;
        let config = config::Config::from(parsed);
        assert_eq!(config.resolv_conf, PathBuf::from(DEFAULT_RESOLV_CONF));
        let wlan = &config.interfaces[0];
        assert_eq!(wlan.technology, Technology::Unknown);
        assert_eq!(wlan.priority, config::DEFAULT_PRIORITY);
        assert_eq!(wlan.ipconfig, IpConfig::default());
        Ok(())
    }

    #[test]
    fn reports_unsupported_keys() -> anyhow::Result<()> {
        let table = r#"
version = 1
log_level = "debug"

[[interface]]
name = "eth0"
metric = 3

[interface.ipconfig]
address = "192.168.1.1"
netmask = "255.255.255.0"

[[interface.ipconfig.routes]]
host = "10.8.0.0"
via = "192.168.1.253"
"#
        .parse::<toml::Table>()?;
        let mut keys = wrong_keys(&table);
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "interface.0.ipconfig.netmask".to_string(),
                "interface.0.ipconfig.routes.0.via".to_string(),
                "interface.0.metric".to_string(),
                "log_level".to_string(),
            ]
        );
        Ok(())
    }
}
