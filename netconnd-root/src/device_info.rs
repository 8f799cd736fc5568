//! Devices known to the daemon.
//!
//! The link and address view is a snapshot taken at startup and on every
//! configuration reload, kept current with the addresses the daemon assigns
//! itself.

use cidr::IpInet;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use netconnd_lib::address;
use netconnd_lib::connection::ConnectionHandle;
use netconnd_lib::device::{Device, DeviceInfo, Technology};

use crate::routing::NetlinkRequest;
use crate::routing::RequestSender;
use crate::routing::netlink_ops::{AddrInfo, LinkInfo};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

const RP_FILTER_STRICT: &str = "1";
const RP_FILTER_LOOSE: &str = "2";

#[derive(Debug, Default)]
struct DeviceState {
    technology: Technology,
    connection: Option<ConnectionHandle>,
    portal_detections: u32,
}

#[derive(Debug)]
pub struct NetDevice {
    index: u32,
    name: String,
    proc_root: PathBuf,
    state: Mutex<DeviceState>,
}

impl NetDevice {
    pub fn new(index: u32, name: impl Into<String>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            index,
            name: name.into(),
            proc_root: proc_root.into(),
            state: Mutex::new(DeviceState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_technology(&self, technology: Technology) {
        self.state().technology = technology;
    }

    pub fn set_connection(&self, connection: Option<ConnectionHandle>) {
        self.state().connection = connection;
    }

    pub fn portal_detections(&self) -> u32 {
        self.state().portal_detections
    }

    fn rp_filter_path(&self) -> PathBuf {
        self.proc_root
            .join("sys/net/ipv4/conf")
            .join(&self.name)
            .join("rp_filter")
    }
}

impl Device for NetDevice {
    fn interface_index(&self) -> u32 {
        self.index
    }

    fn link_name(&self) -> &str {
        &self.name
    }

    fn technology(&self) -> Technology {
        self.state().technology
    }

    fn connection(&self) -> Option<ConnectionHandle> {
        self.state().connection
    }

    fn request_portal_detection(&self) -> bool {
        let mut state = self.state();
        state.portal_detections += 1;
        tracing::info!(link = %self.name, technology = %state.technology, "portal detection requested");
        true
    }

    fn set_loose_routing(&self, enabled: bool) {
        let value = if enabled { RP_FILTER_LOOSE } else { RP_FILTER_STRICT };
        let path = self.rp_filter_path();
        match fs::write(&path, value) {
            Ok(()) => tracing::debug!(link = %self.name, enabled, "updated reverse path filter"),
            Err(error) => {
                tracing::error!(%error, path = %path.display(), "failed to update reverse path filter")
            }
        }
    }

    fn on_connection_updated(&self) {
        tracing::debug!(link = %self.name, connection = ?self.connection(), "connection updated");
    }
}

#[derive(Debug, Default)]
struct State {
    devices: HashMap<u32, Arc<NetDevice>>,
    addresses: HashMap<u32, Vec<IpInet>>,
}

pub struct SystemDeviceInfo {
    requests: RequestSender,
    proc_root: PathBuf,
    state: Mutex<State>,
}

impl SystemDeviceInfo {
    pub fn new(requests: RequestSender, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            requests,
            proc_root: proc_root.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the link and address view with a fresh kernel snapshot.
    ///
    /// Devices that kept their index and name are reused, so the connection
    /// recorded on them survives.
    pub fn refresh(&self, links: &[LinkInfo], addrs: &[AddrInfo]) {
        let mut state = self.state();
        let mut devices = HashMap::with_capacity(links.len());
        for link in links {
            let device = match state.devices.get(&link.index) {
                Some(known) if known.name == link.name => Arc::clone(known),
                _ => Arc::new(NetDevice::new(link.index, link.name.clone(), self.proc_root.clone())),
            };
            devices.insert(link.index, device);
        }
        let mut addresses: HashMap<u32, Vec<IpInet>> = HashMap::new();
        for addr in addrs {
            addresses.entry(addr.if_index).or_default().push(addr.address);
        }
        tracing::debug!(links = devices.len(), addresses = addrs.len(), "refreshed device snapshot");
        state.devices = devices;
        state.addresses = addresses;
    }

    pub fn device(&self, interface_index: u32) -> Option<Arc<NetDevice>> {
        self.state().devices.get(&interface_index).cloned()
    }

    pub fn device_by_name(&self, name: &str) -> Option<Arc<NetDevice>> {
        self.state().devices.values().find(|device| device.name == name).cloned()
    }

    /// Notes an address the daemon assigned to an interface.
    pub fn record_address(&self, interface_index: u32, address: IpInet) {
        let mut state = self.state();
        let addresses = state.addresses.entry(interface_index).or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
}

impl DeviceInfo for SystemDeviceInfo {
    fn get_device(&self, interface_index: u32) -> Option<Arc<dyn Device>> {
        self.device(interface_index).map(|device| device as Arc<dyn Device>)
    }

    fn flush_addresses(&self, interface_index: u32) {
        self.state().addresses.remove(&interface_index);
        if self.requests.send(NetlinkRequest::FlushAddresses(interface_index)).is_err() {
            tracing::error!(interface_index, "netlink worker is gone, addresses not flushed");
        }
    }

    fn has_other_address(&self, interface_index: u32, candidate: &IpInet) -> bool {
        let state = self.state();
        let Some(addresses) = state.addresses.get(&interface_index) else {
            return false;
        };
        let family = address::family_of(candidate);
        let same_family = addresses.iter().filter(|a| address::family_of(a) == family);
        let mut has_other = false;
        for known in same_family {
            if known.address() == candidate.address() {
                return false;
            }
            has_other = true;
        }
        has_other
    }
}
