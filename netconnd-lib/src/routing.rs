//! Routing table collaborator and the kernel objects it manages.

use cidr::IpInet;

use std::net::IpAddr;

use crate::address::{self, IpFamily};
use crate::connection::ConnectionHandle;
use crate::ipconfig::IpConfig;

pub const TABLE_UNSPEC: u32 = 0;
pub const TABLE_MAIN: u32 = 254;
pub const DEFAULT_TAG: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RouteKind {
    #[default]
    Unicast,
    /// Stop looking at this table and continue with the next rule.
    Throw,
    Blackhole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: IpInet,
    pub src: Option<IpInet>,
    pub gateway: Option<IpAddr>,
    pub metric: u32,
    pub scope: RouteScope,
    pub table: u32,
    pub kind: RouteKind,
    pub tag: i32,
}

impl RouteEntry {
    pub fn new(dst: IpInet, gateway: Option<IpAddr>, metric: u32, table: u32) -> Self {
        Self {
            dst,
            src: None,
            gateway,
            metric,
            scope: RouteScope::Universe,
            table,
            kind: RouteKind::Unicast,
            tag: DEFAULT_TAG,
        }
    }

    pub fn with_src(mut self, src: IpInet) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_scope(mut self, scope: RouteScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_kind(mut self, kind: RouteKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }

    pub fn family(&self) -> IpFamily {
        address::family_of(&self.dst)
    }

    pub fn is_default(&self) -> bool {
        self.dst.network_length() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UidRange {
    pub start: u32,
    pub end: u32,
}

impl UidRange {
    pub fn single(uid: u32) -> Self {
        Self { start: uid, end: uid }
    }
}

/// A policy rule: which table a packet is looked up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub family: IpFamily,
    pub priority: u32,
    pub table: u32,
    pub uid_range: Option<UidRange>,
    pub iif_name: Option<String>,
    pub src: Option<IpInet>,
}

impl RuleEntry {
    /// Unconditional rule.
    pub fn new(family: IpFamily, priority: u32, table: u32) -> Self {
        Self {
            family,
            priority,
            table,
            uid_range: None,
            iif_name: None,
            src: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid_range = Some(UidRange::single(uid));
        self
    }

    pub fn with_iif(mut self, name: impl Into<String>) -> Self {
        self.iif_name = Some(name.into());
        self
    }

    pub fn with_src(mut self, src: IpInet) -> Self {
        self.src = Some(src);
        self
    }

    pub fn is_unconditional(&self) -> bool {
        self.uid_range.is_none() && self.iif_name.is_none() && self.src.is_none()
    }
}

/// Kernel routing tables and policy rules.
///
/// Methods returning `bool` report whether the kernel operation was accepted.
/// Interface indices identify the owner of a route or rule so that flushes only
/// remove what that interface installed.
pub trait RoutingTable: Send + Sync {
    fn alloc_table_id(&self) -> Option<u32>;
    fn free_table_id(&self, table: u32);

    fn add_route(&self, interface_index: u32, entry: &RouteEntry) -> bool;
    fn add_rule(&self, interface_index: u32, entry: &RuleEntry) -> bool;

    fn flush_routes(&self, interface_index: u32);
    fn flush_routes_with_tag(&self, tag: i32);
    fn flush_rules(&self, interface_index: u32);

    fn set_default_route(&self, interface_index: u32, gateway: IpAddr, metric: u32, table: u32) -> bool;
    /// Updates the metric of the default route owned by the interface.
    fn set_default_metric(&self, interface_index: u32, metric: u32);

    /// Link scope host route from `local` to `gateway`.
    fn create_link_route(&self, interface_index: u32, local: &IpInet, gateway: IpAddr, table: u32) -> bool;
    fn create_blackhole_route(&self, interface_index: u32, family: IpFamily, metric: u32, table: u32) -> bool;

    /// Asynchronously looks up the route to `address`.
    ///
    /// The answer is delivered later to the connection registry for
    /// `requester`; the resulting host route is tagged with `tag`.
    fn request_route_to_host(
        &self,
        address: IpAddr,
        interface_hint: Option<u32>,
        tag: i32,
        requester: ConnectionHandle,
        table: u32,
    ) -> bool;

    /// Installs the static routes of `config`.
    fn configure_routes(&self, interface_index: u32, config: &IpConfig, metric: u32, table: u32) -> bool;
    fn flush_cache(&self) -> bool;
}
