//! Routing, DNS and binding state of one network interface.
//!
//! A [`Connection`] turns a resolved [`IpConfig`] into kernel state: interface
//! addresses, a routing table, policy rules and resolver configuration. Every
//! connection lives in a [`ConnectionRegistry`], which owns it and performs the
//! operations that look at more than one connection (binding and carrier
//! lookups). Dropping a connection removes all kernel state it installed.

use cidr::IpInet;
use thiserror::Error;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::address::{self, AddressSet, IpFamily};
use crate::device::{DeviceInfo, Technology};
use crate::ipconfig::{DEFAULT_MTU, IpConfig, MIN_IPV4_MTU, MIN_IPV6_MTU, UNDEFINED_MTU};
use crate::resolver::Resolver;
use crate::routing::{RouteEntry, RouteKind, RouteScope, RoutingTable, RuleEntry, TABLE_MAIN, TABLE_UNSPEC};
use crate::rtnl::RtnlHandler;

mod binder;
mod registry;

pub use binder::{ConnectionBinder, DisconnectCallback};
pub use registry::{ConnectionHandle, ConnectionRegistry};

/// Metric of the connection that owns the system default route.
pub const DEFAULT_METRIC: u32 = 1;
/// Metric of every other connection.
pub const NON_DEFAULT_METRIC_BASE: u32 = 10;
/// Priority slot kept between blackhole rules and allow rules.
const BLACKHOLE_RULE_OFFSET: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Address(#[from] address::Error),
    #[error("no routing table id available")]
    NoTableId,
    #[error("unable to set up excluded route for {0}")]
    ExcludedRoute(String),
    #[error("unable to request a host route to {0}")]
    HostRoute(IpAddr),
}

#[derive(Debug, Clone, Copy)]
struct TableSelection {
    table_id: u32,
    per_device_routing: bool,
}

/// Kernel and system facing collaborators shared by all connections.
#[derive(Clone)]
pub struct Collaborators {
    pub routing_table: Arc<dyn RoutingTable>,
    pub device_info: Arc<dyn DeviceInfo>,
    pub rtnl: Arc<dyn RtnlHandler>,
    pub resolver: Arc<dyn Resolver>,
}

impl Collaborators {
    pub fn new(
        routing_table: Arc<dyn RoutingTable>,
        device_info: Arc<dyn DeviceInfo>,
        rtnl: Arc<dyn RtnlHandler>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            routing_table,
            device_info,
            rtnl,
            resolver,
        }
    }
}

pub struct Connection {
    handle: ConnectionHandle,
    interface_index: u32,
    interface_name: String,
    technology: Technology,
    fixed_ip_params: bool,
    tethering: String,

    table_id: u32,
    blackhole_table_id: u32,
    per_device_routing: bool,
    metric: u32,
    use_dns: bool,

    local: Option<IpInet>,
    gateway: Option<IpAddr>,
    has_broadcast_domain: bool,

    // Only filled in shared table mode; entries after the first are installed
    // once the route query for the first one is answered.
    excluded_ips: Vec<IpInet>,
    allowed_uids: Vec<u32>,
    allowed_iifs: Vec<String>,
    blackholed_uids: Vec<u32>,
    blackholed_addrs: AddressSet,

    dns_servers: Vec<String>,
    dns_domain_search: Vec<String>,
    dns_domain_name: String,

    routing_request_count: u32,

    lower_binder: Rc<ConnectionBinder>,
    inbound_binders: VecDeque<Weak<ConnectionBinder>>,

    collaborators: Collaborators,
}

impl Connection {
    fn new(
        handle: ConnectionHandle,
        interface_index: u32,
        interface_name: String,
        technology: Technology,
        fixed_ip_params: bool,
        lower_binder: Rc<ConnectionBinder>,
        collaborators: Collaborators,
    ) -> Self {
        tracing::debug!(interface = %interface_name, interface_index, %technology, "new connection");
        Self {
            handle,
            interface_index,
            interface_name,
            technology,
            fixed_ip_params,
            tethering: String::new(),
            table_id: TABLE_MAIN,
            blackhole_table_id: TABLE_UNSPEC,
            per_device_routing: false,
            metric: NON_DEFAULT_METRIC_BASE,
            use_dns: false,
            local: None,
            gateway: None,
            has_broadcast_domain: false,
            excluded_ips: Vec::new(),
            allowed_uids: Vec::new(),
            allowed_iifs: Vec::new(),
            blackholed_uids: Vec::new(),
            blackholed_addrs: AddressSet::default(),
            dns_servers: Vec::new(),
            dns_domain_search: Vec::new(),
            dns_domain_name: String::new(),
            routing_request_count: 0,
            lower_binder,
            inbound_binders: VecDeque::new(),
            collaborators,
        }
    }

    /// Applies `config` to the kernel and the resolver.
    ///
    /// A malformed address or a failed exclusion setup refuses the whole
    /// configuration. Addresses, gateway and broadcast domain are recorded
    /// only once everything else has been applied.
    pub fn update_from_ipconfig(&mut self, config: &IpConfig) -> Result<(), Error> {
        self.apply_ipconfig(config).inspect_err(|error| {
            tracing::error!(%error, interface = %self.interface_name, "refusing ip configuration");
        })
    }

    fn apply_ipconfig(&mut self, config: &IpConfig) -> Result<(), Error> {
        let local = address::parse_inet(&config.address, config.subnet_prefix)?;
        let family = address::family_of(&local);
        if let Some(expected) = config.address_family {
            address::ensure_family(local.address(), expected)?;
        }
        let mut gateway = parse_in_family(&config.gateway, family)?;
        let mut peer = parse_in_family(&config.peer_address, family)?;
        let mut broadcast = parse_in_family(&config.broadcast_address, family)?;
        if broadcast.is_none() && peer.is_none() && family == IpFamily::V4 {
            broadcast = address::default_broadcast(&local);
            tracing::warn!(interface = %self.interface_name, ?broadcast, "no broadcast address provided, using subnet default");
        }
        let excluded = config
            .exclusion_list
            .iter()
            .map(|cidr| address::parse_cidr(cidr))
            .collect::<Result<Vec<_>, _>>()?;

        let previous_table = self.select_routing_table(config)?;
        let trusted_ip = match self.setup_excluded_routes(excluded, gateway) {
            Ok(trusted_ip) => trusted_ip,
            Err(error) => {
                self.restore_table(previous_table);
                return Err(error);
            }
        };
        if !self.fix_gateway_reachability(&local, &mut peer, &mut gateway, trusted_ip) {
            tracing::warn!(interface = %self.interface_name, "expect limited network connectivity");
        }

        let routing_table = Arc::clone(&self.collaborators.routing_table);
        if !self.fixed_ip_params {
            if self.collaborators.device_info.has_other_address(self.interface_index, &local) {
                tracing::info!(interface = %self.interface_name, %local, "interface address changed, flushing routes and addresses");
                routing_table.flush_routes(self.interface_index);
                self.collaborators.device_info.flush_addresses(self.interface_index);
            }
            if !self
                .collaborators
                .rtnl
                .add_interface_address(self.interface_index, &local, broadcast, peer)
            {
                tracing::error!(interface = %self.interface_name, %local, "failed to add interface address");
            }
            self.apply_mtu(config.mtu, family);
        }

        if let Some(gateway) = gateway
            && config.default_route
            && !routing_table.set_default_route(self.interface_index, gateway, self.metric, self.table_id)
        {
            tracing::error!(interface = %self.interface_name, %gateway, "failed to set default route");
        }

        self.update_blackhole_table(config);
        self.allowed_uids = config.allowed_uids.clone();
        self.allowed_iifs = config.allowed_iifs.clone();
        self.update_routing_policy();
        // nothing refers to the replaced table anymore
        self.free_table(previous_table.table_id);

        if !routing_table.configure_routes(self.interface_index, config, DEFAULT_METRIC, self.table_id) {
            tracing::warn!(interface = %self.interface_name, "failed to configure static routes");
        }
        if config.blackhole_ipv6
            && !routing_table.create_blackhole_route(self.interface_index, IpFamily::V6, 0, self.table_id)
        {
            tracing::error!(interface = %self.interface_name, "failed to create IPv6 blackhole route");
        }

        if let Some(servers) = config.dns_servers.as_ref().filter(|s| !s.is_empty()) {
            self.dns_servers = servers.clone();
        }
        if let Some(search) = config.domain_search.as_ref().filter(|s| !s.is_empty()) {
            self.dns_domain_search = search.clone();
        }
        if let Some(name) = config.domain_name.as_ref().filter(|n| !n.is_empty()) {
            self.dns_domain_name = name.clone();
        }
        self.push_dns_config();

        self.local = Some(local);
        self.gateway = gateway;
        self.has_broadcast_domain = peer.is_none();
        routing_table.flush_cache();
        tracing::info!(interface = %self.interface_name, %local, ?gateway, table = self.table_id, "applied ip configuration");
        Ok(())
    }

    /// Switches to the table `config` needs and returns the one in use before.
    /// The previous table stays allocated until the caller frees or restores it.
    fn select_routing_table(&mut self, config: &IpConfig) -> Result<TableSelection, Error> {
        let previous = TableSelection {
            table_id: self.table_id,
            per_device_routing: self.per_device_routing,
        };
        if config.needs_per_device_routing() {
            self.table_id = self
                .collaborators
                .routing_table
                .alloc_table_id()
                .ok_or(Error::NoTableId)?;
            self.per_device_routing = true;
            tracing::debug!(interface = %self.interface_name, table = self.table_id, "using per-device routing table");
        } else {
            self.table_id = TABLE_MAIN;
            self.per_device_routing = false;
        }
        Ok(previous)
    }

    fn restore_table(&mut self, previous: TableSelection) {
        self.free_table(self.table_id);
        self.table_id = previous.table_id;
        self.per_device_routing = previous.per_device_routing;
    }

    fn free_table(&self, table_id: u32) {
        if table_id != TABLE_MAIN {
            self.collaborators.routing_table.free_table_id(table_id);
        }
    }

    fn update_blackhole_table(&mut self, config: &IpConfig) {
        self.blackholed_uids = config.blackholed_uids.clone();
        self.blackholed_addrs = config.blackholed_addrs.clone();
        if !config.has_blackhole_entries() || self.blackhole_table_id != TABLE_UNSPEC {
            return;
        }

        let routing_table = &self.collaborators.routing_table;
        let Some(table) = routing_table.alloc_table_id() else {
            tracing::error!(interface = %self.interface_name, "no routing table id available for blackhole table");
            return;
        };
        self.blackhole_table_id = table;
        for family in [IpFamily::V4, IpFamily::V6] {
            if !routing_table.create_blackhole_route(self.interface_index, family, 0, table) {
                tracing::error!(interface = %self.interface_name, %family, table, "failed to create blackhole route");
            }
        }
    }

    /// Routes excluded destinations around this connection.
    ///
    /// With a table of its own every excluded network becomes a throw route.
    /// Otherwise the first excluded address is pinned through an asynchronous
    /// host route lookup and returned as the trusted address; the remaining
    /// ones wait for the lookup's answer.
    fn setup_excluded_routes(&mut self, excluded: Vec<IpInet>, gateway: Option<IpAddr>) -> Result<Option<IpAddr>, Error> {
        if self.per_device_routing {
            for dst in &excluded {
                let entry = RouteEntry::new(*dst, None, 0, self.table_id).with_kind(RouteKind::Throw);
                if !self.collaborators.routing_table.add_route(self.interface_index, &entry) {
                    return Err(Error::ExcludedRoute(dst.to_string()));
                }
            }
            self.replace_pinned_routes(Vec::new());
            return Ok(None);
        }

        let Some(trusted_ip) = excluded.first().map(|dst| dst.address()) else {
            self.replace_pinned_routes(Vec::new());
            return Ok(None);
        };
        self.pin_host_route(trusted_ip, gateway)?;
        self.replace_pinned_routes(excluded);
        Ok(Some(trusted_ip))
    }

    /// Drops the host routes pinned for the previous exclusion list. Routes
    /// for `excluded` are installed once the pending lookup answers.
    fn replace_pinned_routes(&mut self, excluded: Vec<IpInet>) {
        if !self.excluded_ips.is_empty() {
            self.collaborators.routing_table.flush_routes_with_tag(self.route_tag());
        }
        self.excluded_ips = excluded;
    }

    fn pin_host_route(&self, trusted_ip: IpAddr, gateway: Option<IpAddr>) -> Result<(), Error> {
        if gateway.is_none() {
            // no gateway route to interfere with the primary connection either
            tracing::warn!(interface = %self.interface_name, %trusted_ip, "no gateway, unable to pin host route");
            return Ok(());
        }
        self.request_host_route(trusted_ip)
    }

    /// Asks the routing table for the route to `address` on any interface.
    /// The answer arrives through [`ConnectionRegistry::on_route_query_response`].
    pub fn request_host_route(&self, address: IpAddr) -> Result<(), Error> {
        let accepted = self.collaborators.routing_table.request_route_to_host(
            address,
            None,
            self.route_tag(),
            self.handle,
            self.table_id,
        );
        if accepted {
            Ok(())
        } else {
            Err(Error::HostRoute(address))
        }
    }

    pub(crate) fn install_deferred_exclusions(&self, interface_index: u32, gateway: Option<IpAddr>) {
        for dst in self.excluded_ips.iter().skip(1) {
            let entry = RouteEntry::new(*dst, gateway, 0, self.table_id).with_tag(self.route_tag());
            if !self.collaborators.routing_table.add_route(interface_index, &entry) {
                tracing::warn!(interface = %self.interface_name, %dst, interface_index, "unable to pin excluded route");
            }
        }
    }

    /// Makes sure the gateway can be reached from `local`.
    ///
    /// Returns false when the configuration will only give limited
    /// connectivity. `peer` and `gateway` are cleared when point-to-point
    /// routing must not use them.
    pub fn fix_gateway_reachability(
        &self,
        local: &IpInet,
        peer: &mut Option<IpAddr>,
        gateway: &mut Option<IpAddr>,
        trusted_ip: Option<IpAddr>,
    ) -> bool {
        if self.per_device_routing && peer.is_some() {
            // the kernel would add a main table route for the peer
            *gateway = None;
            *peer = None;
            return true;
        }

        let Some(gw) = *gateway else {
            tracing::warn!(interface = %self.interface_name, "no gateway address was provided");
            return false;
        };

        if let Some(peer_address) = *peer {
            if peer_address != gw {
                tracing::warn!(interface = %self.interface_name, gateway = %gw, peer = %peer_address, "gateway does not match peer address");
                return false;
            }
            if trusted_ip == Some(gw) {
                // point-to-point traffic does not need a gateway and the
                // trusted address must keep its pinned route
                *gateway = None;
                *peer = None;
            }
            return true;
        }

        if address::can_reach(local, &gw) || address::family_of(local) == IpFamily::V6 {
            return true;
        }

        tracing::warn!(interface = %self.interface_name, gateway = %gw, %local, "gateway unreachable from local subnet, adding link route");
        let entry = RouteEntry::new(address::host(gw), None, 0, self.table_id).with_scope(RouteScope::Link);
        if !self.collaborators.routing_table.add_route(self.interface_index, &entry) {
            tracing::error!(interface = %self.interface_name, gateway = %gw, "unable to add link route to gateway");
            return false;
        }
        true
    }

    /// Rebuilds every policy rule of this connection.
    pub fn update_routing_policy(&self) {
        let routing_table = &self.collaborators.routing_table;
        routing_table.flush_rules(self.interface_index);

        let mut offset = 0;
        if self.blackhole_table_id != TABLE_UNSPEC {
            for uid in &self.blackholed_uids {
                for family in [IpFamily::V4, IpFamily::V6] {
                    self.add_rule(RuleEntry::new(family, self.metric, self.blackhole_table_id).with_uid(*uid));
                }
            }
            for addr in self.blackholed_addrs.iter() {
                self.add_rule(
                    RuleEntry::new(IpFamily::of(addr), self.metric, self.blackhole_table_id).with_src(address::host(*addr)),
                );
            }
            offset = BLACKHOLE_RULE_OFFSET;
        }

        let priority = self.metric + offset;
        for uid in &self.allowed_uids {
            for family in [IpFamily::V4, IpFamily::V6] {
                self.add_rule(RuleEntry::new(family, priority, self.table_id).with_uid(*uid));
            }
        }
        for iif in &self.allowed_iifs {
            for family in [IpFamily::V4, IpFamily::V6] {
                self.add_rule(RuleEntry::new(family, priority, self.table_id).with_iif(iif.as_str()));
            }
        }

        let unrestricted = self.allowed_uids.is_empty()
            && self.allowed_iifs.is_empty()
            && self.blackholed_uids.is_empty()
            && self.blackholed_addrs.is_empty();
        if unrestricted {
            for family in [IpFamily::V4, IpFamily::V6] {
                self.add_rule(RuleEntry::new(family, priority, self.table_id));
            }
        }
    }

    fn add_rule(&self, entry: RuleEntry) {
        if !self.collaborators.routing_table.add_rule(self.interface_index, &entry) {
            tracing::warn!(interface = %self.interface_name, ?entry, "failed to add routing rule");
        }
    }

    pub fn set_metric(&mut self, metric: u32) {
        if metric == self.metric {
            return;
        }
        tracing::info!(interface = %self.interface_name, from = self.metric, to = metric, "changing metric");

        let routing_table = Arc::clone(&self.collaborators.routing_table);
        if !self.per_device_routing {
            routing_table.set_default_metric(self.interface_index, metric);
        }
        self.metric = metric;
        self.update_routing_policy();
        self.push_dns_config();

        if metric == DEFAULT_METRIC {
            match self.collaborators.device_info.get_device(self.interface_index) {
                Some(device) => {
                    device.request_portal_detection();
                }
                None => tracing::warn!(interface = %self.interface_name, "no device to run portal detection on"),
            }
        }
        routing_table.flush_cache();
    }

    pub fn set_use_dns(&mut self, use_dns: bool) {
        self.use_dns = use_dns;
    }

    pub fn update_dns_servers(&mut self, servers: &[String]) {
        self.dns_servers = servers.to_vec();
        self.push_dns_config();
    }

    /// Hands DNS servers and search domains to the resolver, if this
    /// connection is the DNS source.
    pub fn push_dns_config(&self) {
        if !self.use_dns {
            return;
        }
        let search_domains = if !self.dns_domain_search.is_empty() {
            self.dns_domain_search.clone()
        } else if !self.dns_domain_name.is_empty() {
            vec![format!("{}.", self.dns_domain_name)]
        } else {
            Vec::new()
        };
        if !self.collaborators.resolver.set_dns_from_lists(&self.dns_servers, &search_domains) {
            tracing::warn!(interface = %self.interface_name, "resolver refused DNS configuration");
        }
    }

    pub fn set_mtu(&self, mtu: u32) {
        let family = if self.is_ipv6() { IpFamily::V6 } else { IpFamily::V4 };
        self.apply_mtu(mtu, family);
    }

    fn apply_mtu(&self, mtu: u32, family: IpFamily) {
        let min = match family {
            IpFamily::V4 => MIN_IPV4_MTU,
            IpFamily::V6 => MIN_IPV6_MTU,
        };
        let mtu = if mtu == UNDEFINED_MTU {
            DEFAULT_MTU
        } else if mtu < min {
            tracing::debug!(interface = %self.interface_name, requested = mtu, min, "raising mtu to family minimum");
            min
        } else {
            mtu
        };
        self.collaborators.rtnl.set_interface_mtu(self.interface_index, mtu);
    }

    /// Enables loose reverse path filtering while at least one request is held.
    pub fn request_routing(&mut self) {
        self.routing_request_count += 1;
        if self.routing_request_count > 1 {
            return;
        }
        match self.collaborators.device_info.get_device(self.interface_index) {
            Some(device) => device.set_loose_routing(true),
            None => tracing::error!(interface = %self.interface_name, "no device for routing request"),
        }
    }

    pub fn release_routing(&mut self) {
        if self.routing_request_count == 0 {
            tracing::warn!(interface = %self.interface_name, "routing released without a request");
            return;
        }
        self.routing_request_count -= 1;
        if self.routing_request_count > 0 {
            return;
        }
        match self.collaborators.device_info.get_device(self.interface_index) {
            Some(device) => device.set_loose_routing(false),
            None => tracing::error!(interface = %self.interface_name, "no device for routing release"),
        }
        // routes cached while filtering was loose
        self.collaborators.routing_table.flush_cache();
    }

    /// Keeps the gateway of this connection reachable for connections layered
    /// on top of it.
    pub fn create_gateway_route(&self) -> bool {
        if !self.has_broadcast_domain {
            return false;
        }
        let (Some(local), Some(gateway)) = (self.local, self.gateway) else {
            return false;
        };
        self.collaborators
            .routing_table
            .create_link_route(self.interface_index, &local, gateway, self.table_id)
    }

    fn route_tag(&self) -> i32 {
        self.interface_index as i32
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn interface_index(&self) -> u32 {
        self.interface_index
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn technology(&self) -> Technology {
        self.technology
    }

    pub fn fixed_ip_params(&self) -> bool {
        self.fixed_ip_params
    }

    pub fn tethering(&self) -> &str {
        &self.tethering
    }

    pub fn set_tethering(&mut self, tethering: impl Into<String>) {
        self.tethering = tethering.into();
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn blackhole_table_id(&self) -> u32 {
        self.blackhole_table_id
    }

    pub fn per_device_routing(&self) -> bool {
        self.per_device_routing
    }

    pub fn metric(&self) -> u32 {
        self.metric
    }

    pub fn is_default(&self) -> bool {
        self.metric == DEFAULT_METRIC
    }

    pub fn use_dns(&self) -> bool {
        self.use_dns
    }

    pub fn local(&self) -> Option<IpInet> {
        self.local
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.gateway
    }

    pub fn has_broadcast_domain(&self) -> bool {
        self.has_broadcast_domain
    }

    pub fn is_ipv6(&self) -> bool {
        self.local.is_some_and(|local| address::family_of(&local) == IpFamily::V6)
    }

    /// Local subnet in CIDR notation, empty without an address.
    pub fn subnet_name(&self) -> String {
        self.local.as_ref().map(address::subnet_name).unwrap_or_default()
    }

    pub fn dns_servers(&self) -> &[String] {
        &self.dns_servers
    }

    pub fn dns_domain_search(&self) -> &[String] {
        &self.dns_domain_search
    }

    pub fn dns_domain_name(&self) -> &str {
        &self.dns_domain_name
    }

    pub fn routing_request_count(&self) -> u32 {
        self.routing_request_count
    }

    pub fn lower_binder(&self) -> &Rc<ConnectionBinder> {
        &self.lower_binder
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::info!(interface = %self.interface_name, "removing connection state");
        let routing_table = &self.collaborators.routing_table;
        routing_table.flush_routes(self.interface_index);
        routing_table.flush_routes_with_tag(self.route_tag());
        if !self.fixed_ip_params {
            self.collaborators.device_info.flush_addresses(self.interface_index);
        }
        routing_table.flush_rules(self.interface_index);
        if self.table_id != TABLE_MAIN {
            routing_table.free_table_id(self.table_id);
        }
        if self.blackhole_table_id != TABLE_UNSPEC {
            routing_table.free_table_id(self.blackhole_table_id);
        }
    }
}

fn parse_in_family(value: &str, family: IpFamily) -> Result<Option<IpAddr>, address::Error> {
    address::parse_optional_addr(value)?
        .map(|addr| address::ensure_family(addr, family))
        .transpose()
}
