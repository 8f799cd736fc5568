use cidr::IpInet;

use std::net::IpAddr;
use std::sync::Arc;

use netconnd_lib::rtnl::RtnlHandler;

use super::netlink_ops::AddressSpec;
use super::worker::{NetlinkRequest, RequestSender};
use crate::device_info::SystemDeviceInfo;

/// [`RtnlHandler`] queuing address and link changes to the netlink worker.
pub struct KernelRtnlHandler {
    requests: RequestSender,
    device_info: Arc<SystemDeviceInfo>,
}

impl KernelRtnlHandler {
    pub fn new(requests: RequestSender, device_info: Arc<SystemDeviceInfo>) -> Self {
        Self { requests, device_info }
    }
}

impl RtnlHandler for KernelRtnlHandler {
    fn add_interface_address(
        &self,
        interface_index: u32,
        local: &IpInet,
        broadcast: Option<IpAddr>,
        peer: Option<IpAddr>,
    ) -> bool {
        let request = NetlinkRequest::AddAddress(AddressSpec {
            if_index: interface_index,
            local: *local,
            broadcast,
            peer,
        });
        if self.requests.send(request).is_err() {
            tracing::error!(interface_index, %local, "netlink worker is gone, address not added");
            return false;
        }
        self.device_info.record_address(interface_index, *local);
        true
    }

    fn set_interface_mtu(&self, interface_index: u32, mtu: u32) {
        if self
            .requests
            .send(NetlinkRequest::SetMtu {
                if_index: interface_index,
                mtu,
            })
            .is_err()
        {
            tracing::error!(interface_index, mtu, "netlink worker is gone, mtu not set");
        }
    }
}
