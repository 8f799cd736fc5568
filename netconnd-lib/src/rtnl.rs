use cidr::IpInet;

use std::net::IpAddr;

/// Interface address and link attribute mutation.
pub trait RtnlHandler: Send + Sync {
    fn add_interface_address(
        &self,
        interface_index: u32,
        local: &IpInet,
        broadcast: Option<IpAddr>,
        peer: Option<IpAddr>,
    ) -> bool;
    fn set_interface_mtu(&self, interface_index: u32, mtu: u32);
}
