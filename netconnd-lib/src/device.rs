use cidr::IpInet;
use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::sync::Arc;

use crate::connection::ConnectionHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Ethernet,
    Wifi,
    Cellular,
    Vpn,
    Ppp,
    Tunnel,
    #[default]
    Unknown,
}

impl Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technology::Ethernet => "ethernet",
            Technology::Wifi => "wifi",
            Technology::Cellular => "cellular",
            Technology::Vpn => "vpn",
            Technology::Ppp => "ppp",
            Technology::Tunnel => "tunnel",
            Technology::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// A network device as seen by its connection.
pub trait Device: Send + Sync {
    fn interface_index(&self) -> u32;
    fn link_name(&self) -> &str;
    fn technology(&self) -> Technology;
    /// Connection currently running on this device.
    fn connection(&self) -> Option<ConnectionHandle>;
    fn request_portal_detection(&self) -> bool;
    /// Loose reverse path filtering on the device.
    fn set_loose_routing(&self, enabled: bool);
    fn on_connection_updated(&self);
}

pub trait DeviceInfo: Send + Sync {
    fn get_device(&self, interface_index: u32) -> Option<Arc<dyn Device>>;
    fn flush_addresses(&self, interface_index: u32);
    /// True when the interface carries another address of the same family and
    /// not `address` itself.
    fn has_other_address(&self, interface_index: u32, address: &IpInet) -> bool;
}
