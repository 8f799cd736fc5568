use serde::{Deserialize, Serialize};

use crate::address::{AddressSet, IpFamily};

pub const DEFAULT_MTU: u32 = 1500;
pub const MIN_IPV4_MTU: u32 = 576;
pub const MIN_IPV6_MTU: u32 = 1280;
pub const UNDEFINED_MTU: u32 = 0;

/// Resolved IP configuration of one interface.
///
/// Addresses are kept as strings until a connection applies them, so that a
/// malformed value can be refused without touching any kernel state. An empty
/// string means "unset".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub address_family: Option<IpFamily>,
    pub address: String,
    pub subnet_prefix: u8,
    pub broadcast_address: String,
    pub peer_address: String,
    pub gateway: String,
    /// `None` leaves previously applied servers in place.
    pub dns_servers: Option<Vec<String>>,
    pub domain_search: Option<Vec<String>>,
    pub domain_name: Option<String>,
    pub mtu: u32,
    pub default_route: bool,
    pub blackhole_ipv6: bool,
    pub allowed_uids: Vec<u32>,
    pub allowed_iifs: Vec<String>,
    pub blackholed_uids: Vec<u32>,
    pub blackholed_addrs: AddressSet,
    pub exclusion_list: Vec<String>,
    pub routes: Vec<StaticRoute>,
}

/// An explicitly configured route, installed in addition to the default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub host: String,
    pub prefix: u8,
    pub gateway: String,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            address_family: None,
            address: String::new(),
            subnet_prefix: 0,
            broadcast_address: String::new(),
            peer_address: String::new(),
            gateway: String::new(),
            dns_servers: None,
            domain_search: None,
            domain_name: None,
            mtu: UNDEFINED_MTU,
            default_route: true,
            blackhole_ipv6: false,
            allowed_uids: Vec::new(),
            allowed_iifs: Vec::new(),
            blackholed_uids: Vec::new(),
            blackholed_addrs: AddressSet::default(),
            exclusion_list: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl IpConfig {
    /// Per-uid or per-iif restrictions and IPv6 blackholing need a routing
    /// table of their own.
    pub fn needs_per_device_routing(&self) -> bool {
        !self.allowed_uids.is_empty() || !self.allowed_iifs.is_empty() || self.blackhole_ipv6
    }

    pub fn has_blackhole_entries(&self) -> bool {
        !self.blackholed_uids.is_empty() || !self.blackholed_addrs.is_empty()
    }
}
