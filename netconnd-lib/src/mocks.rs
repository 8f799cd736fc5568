//! Stateful mocks for the connection collaborators.
//!
//! These mocks track the resulting kernel and system _state_ (tables, routes,
//! rules, addresses, resolver contents) rather than call sequences, so tests
//! can assert on what a lifecycle operation leaves behind.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability. Any operation named
//! in a state's `fail_on` set reports failure.

use cidr::IpInet;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::{self, IpFamily};
use crate::connection::{Collaborators, ConnectionHandle};
use crate::device::{Device, DeviceInfo, Technology};
use crate::ipconfig::IpConfig;
use crate::resolver::Resolver;
use crate::routing::{RouteEntry, RouteKind, RouteScope, RoutingTable, RuleEntry};
use crate::rtnl::RtnlHandler;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MockRoutingTable
// ============================================================================

pub const FIRST_TABLE_ID: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct DefaultRoute {
    pub interface_index: u32,
    pub gateway: IpAddr,
    pub metric: u32,
    pub table: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteQuery {
    pub address: IpAddr,
    pub interface_hint: Option<u32>,
    pub tag: i32,
    pub requester: ConnectionHandle,
    pub table: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredRoutes {
    pub interface_index: u32,
    pub metric: u32,
    pub table: u32,
    pub route_count: usize,
}

#[derive(Debug, Default)]
pub struct RoutingState {
    pub next_table_id: Option<u32>,
    pub allocated_tables: BTreeSet<u32>,
    /// Every free, in order, including frees of unknown ids.
    pub freed_tables: Vec<u32>,
    pub routes: Vec<(u32, RouteEntry)>,
    pub rules: Vec<(u32, RuleEntry)>,
    pub default_routes: Vec<DefaultRoute>,
    pub route_queries: Vec<RouteQuery>,
    pub configured_routes: Vec<ConfiguredRoutes>,
    pub cache_flushes: u32,
    pub rule_flushes: u32,
    pub fail_on: HashSet<String>,
}

impl RoutingState {
    fn fails(&self, op: &str) -> bool {
        self.fail_on.contains(op)
    }

    pub fn routes_of(&self, interface_index: u32) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .filter(|(index, _)| *index == interface_index)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn rules_of(&self, interface_index: u32) -> Vec<RuleEntry> {
        self.rules
            .iter()
            .filter(|(index, _)| *index == interface_index)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn default_route_of(&self, interface_index: u32) -> Option<DefaultRoute> {
        self.default_routes
            .iter()
            .find(|route| route.interface_index == interface_index)
            .cloned()
    }
}

#[derive(Clone, Default)]
pub struct MockRoutingTable {
    pub state: Arc<Mutex<RoutingState>>,
}

impl MockRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RoutingState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn fail_on(&self, op: &str) {
        lock(&self.state).fail_on.insert(op.to_string());
    }

    pub fn state(&self) -> MutexGuard<'_, RoutingState> {
        lock(&self.state)
    }
}

impl RoutingTable for MockRoutingTable {
    fn alloc_table_id(&self) -> Option<u32> {
        let mut s = lock(&self.state);
        if s.fails("alloc_table_id") {
            return None;
        }
        let id = s.next_table_id.unwrap_or(FIRST_TABLE_ID);
        s.next_table_id = Some(id + 1);
        s.allocated_tables.insert(id);
        Some(id)
    }

    fn free_table_id(&self, table: u32) {
        let mut s = lock(&self.state);
        s.allocated_tables.remove(&table);
        s.freed_tables.push(table);
    }

    fn add_route(&self, interface_index: u32, entry: &RouteEntry) -> bool {
        let mut s = lock(&self.state);
        if s.fails("add_route") {
            return false;
        }
        s.routes.push((interface_index, entry.clone()));
        true
    }

    fn add_rule(&self, interface_index: u32, entry: &RuleEntry) -> bool {
        let mut s = lock(&self.state);
        if s.fails("add_rule") {
            return false;
        }
        s.rules.push((interface_index, entry.clone()));
        true
    }

    fn flush_routes(&self, interface_index: u32) {
        let mut s = lock(&self.state);
        s.routes.retain(|(index, _)| *index != interface_index);
        s.default_routes.retain(|route| route.interface_index != interface_index);
    }

    fn flush_routes_with_tag(&self, tag: i32) {
        lock(&self.state).routes.retain(|(_, entry)| entry.tag != tag);
    }

    fn flush_rules(&self, interface_index: u32) {
        let mut s = lock(&self.state);
        s.rules.retain(|(index, _)| *index != interface_index);
        s.rule_flushes += 1;
    }

    fn set_default_route(&self, interface_index: u32, gateway: IpAddr, metric: u32, table: u32) -> bool {
        let mut s = lock(&self.state);
        if s.fails("set_default_route") {
            return false;
        }
        s.default_routes.retain(|route| route.interface_index != interface_index);
        s.default_routes.push(DefaultRoute {
            interface_index,
            gateway,
            metric,
            table,
        });
        true
    }

    fn set_default_metric(&self, interface_index: u32, metric: u32) {
        let mut s = lock(&self.state);
        for route in s.default_routes.iter_mut().filter(|r| r.interface_index == interface_index) {
            route.metric = metric;
        }
    }

    fn create_link_route(&self, interface_index: u32, local: &IpInet, gateway: IpAddr, table: u32) -> bool {
        let mut s = lock(&self.state);
        if s.fails("create_link_route") {
            return false;
        }
        let entry = RouteEntry::new(address::host(gateway), None, 0, table)
            .with_src(*local)
            .with_scope(RouteScope::Link);
        s.routes.push((interface_index, entry));
        true
    }

    fn create_blackhole_route(&self, interface_index: u32, family: IpFamily, metric: u32, table: u32) -> bool {
        let mut s = lock(&self.state);
        if s.fails("create_blackhole_route") {
            return false;
        }
        let entry = RouteEntry::new(address::any(family), None, metric, table).with_kind(RouteKind::Blackhole);
        s.routes.push((interface_index, entry));
        true
    }

    fn request_route_to_host(
        &self,
        address: IpAddr,
        interface_hint: Option<u32>,
        tag: i32,
        requester: ConnectionHandle,
        table: u32,
    ) -> bool {
        let mut s = lock(&self.state);
        if s.fails("request_route_to_host") {
            return false;
        }
        s.route_queries.push(RouteQuery {
            address,
            interface_hint,
            tag,
            requester,
            table,
        });
        true
    }

    fn configure_routes(&self, interface_index: u32, config: &IpConfig, metric: u32, table: u32) -> bool {
        let mut s = lock(&self.state);
        if s.fails("configure_routes") {
            return false;
        }
        s.configured_routes.push(ConfiguredRoutes {
            interface_index,
            metric,
            table,
            route_count: config.routes.len(),
        });
        true
    }

    fn flush_cache(&self) -> bool {
        let mut s = lock(&self.state);
        s.cache_flushes += 1;
        !s.fails("flush_cache")
    }
}

// ============================================================================
// MockDevice / MockDeviceInfo
// ============================================================================

#[derive(Debug, Default)]
pub struct DeviceState {
    pub connection: Option<ConnectionHandle>,
    /// Every loose routing change, in order.
    pub loose_routing: Vec<bool>,
    pub portal_detections: u32,
    pub connection_updates: u32,
}

pub struct MockDevice {
    interface_index: u32,
    link_name: String,
    technology: Technology,
    pub state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new(interface_index: u32, link_name: &str, technology: Technology) -> Arc<Self> {
        Arc::new(Self {
            interface_index,
            link_name: link_name.to_string(),
            technology,
            state: Arc::new(Mutex::new(DeviceState::default())),
        })
    }

    pub fn set_connection(&self, connection: Option<ConnectionHandle>) {
        lock(&self.state).connection = connection;
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }
}

impl Device for MockDevice {
    fn interface_index(&self) -> u32 {
        self.interface_index
    }

    fn link_name(&self) -> &str {
        &self.link_name
    }

    fn technology(&self) -> Technology {
        self.technology
    }

    fn connection(&self) -> Option<ConnectionHandle> {
        lock(&self.state).connection
    }

    fn request_portal_detection(&self) -> bool {
        lock(&self.state).portal_detections += 1;
        true
    }

    fn set_loose_routing(&self, enabled: bool) {
        lock(&self.state).loose_routing.push(enabled);
    }

    fn on_connection_updated(&self) {
        lock(&self.state).connection_updates += 1;
    }
}

#[derive(Default)]
pub struct DeviceInfoState {
    pub devices: HashMap<u32, Arc<MockDevice>>,
    pub addresses: HashMap<u32, Vec<IpInet>>,
    pub flushed_addresses: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct MockDeviceInfo {
    pub state: Arc<Mutex<DeviceInfoState>>,
}

impl MockDeviceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: Arc<MockDevice>) {
        lock(&self.state).devices.insert(device.interface_index, device);
    }

    pub fn add_address(&self, interface_index: u32, address: IpInet) {
        lock(&self.state).addresses.entry(interface_index).or_default().push(address);
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceInfoState> {
        lock(&self.state)
    }
}

impl DeviceInfo for MockDeviceInfo {
    fn get_device(&self, interface_index: u32) -> Option<Arc<dyn Device>> {
        let device: Arc<dyn Device> = lock(&self.state).devices.get(&interface_index).cloned()?;
        Some(device)
    }

    fn flush_addresses(&self, interface_index: u32) {
        let mut s = lock(&self.state);
        s.addresses.remove(&interface_index);
        s.flushed_addresses.push(interface_index);
    }

    fn has_other_address(&self, interface_index: u32, address: &IpInet) -> bool {
        let s = lock(&self.state);
        let family = address::family_of(address);
        let same_family: Vec<&IpInet> = s
            .addresses
            .get(&interface_index)
            .map(|addresses| addresses.iter().filter(|a| address::family_of(a) == family).collect())
            .unwrap_or_default();
        let has_this = same_family.iter().any(|a| a.address() == address.address());
        !has_this && !same_family.is_empty()
    }
}

// ============================================================================
// MockRtnlHandler
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceAddress {
    pub interface_index: u32,
    pub local: IpInet,
    pub broadcast: Option<IpAddr>,
    pub peer: Option<IpAddr>,
}

#[derive(Debug, Default)]
pub struct RtnlState {
    pub addresses: Vec<InterfaceAddress>,
    pub mtus: HashMap<u32, u32>,
    pub mtu_updates: u32,
    pub fail_on: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockRtnlHandler {
    pub state: Arc<Mutex<RtnlState>>,
}

impl MockRtnlHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, RtnlState> {
        lock(&self.state)
    }
}

impl RtnlHandler for MockRtnlHandler {
    fn add_interface_address(
        &self,
        interface_index: u32,
        local: &IpInet,
        broadcast: Option<IpAddr>,
        peer: Option<IpAddr>,
    ) -> bool {
        let mut s = lock(&self.state);
        if s.fail_on.contains("add_interface_address") {
            return false;
        }
        s.addresses.push(InterfaceAddress {
            interface_index,
            local: *local,
            broadcast,
            peer,
        });
        true
    }

    fn set_interface_mtu(&self, interface_index: u32, mtu: u32) {
        let mut s = lock(&self.state);
        s.mtus.insert(interface_index, mtu);
        s.mtu_updates += 1;
    }
}

// ============================================================================
// MockResolver
// ============================================================================

#[derive(Debug, Default)]
pub struct ResolverState {
    pub servers: Vec<String>,
    pub search_domains: Vec<String>,
    pub updates: u32,
    pub fail_on: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockResolver {
    pub state: Arc<Mutex<ResolverState>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ResolverState> {
        lock(&self.state)
    }
}

impl Resolver for MockResolver {
    fn set_dns_from_lists(&self, servers: &[String], search_domains: &[String]) -> bool {
        let mut s = lock(&self.state);
        if s.fail_on.contains("set_dns_from_lists") {
            return false;
        }
        s.servers = servers.to_vec();
        s.search_domains = search_domains.to_vec();
        s.updates += 1;
        true
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// One mock per collaborator, sharing state with the [`Collaborators`] they
/// hand out.
#[derive(Clone, Default)]
pub struct MockCollaborators {
    pub routing_table: MockRoutingTable,
    pub device_info: MockDeviceInfo,
    pub rtnl: MockRtnlHandler,
    pub resolver: MockResolver,
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::new(self.routing_table.clone()),
            Arc::new(self.device_info.clone()),
            Arc::new(self.rtnl.clone()),
            Arc::new(self.resolver.clone()),
        )
    }
}
