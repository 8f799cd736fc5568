//! [`RoutingTable`] backed by the kernel.
//!
//! Every route and rule installed on behalf of an interface is remembered
//! here, so flushes delete exactly what this daemon added and leave routes of
//! other programs alone. Kernel mutations are queued to the netlink worker.

use cidr::IpInet;

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use netconnd_lib::address::{self, IpFamily};
use netconnd_lib::connection::ConnectionHandle;
use netconnd_lib::ipconfig::{IpConfig, StaticRoute};
use netconnd_lib::routing::{RouteEntry, RouteKind, RouteScope, RoutingTable, RuleEntry};

use super::netlink_ops::RouteSpec;
use super::worker::{NetlinkRequest, RequestSender, RouteAnswer, RouteQuery};

/// First table id handed out; lower ids are left to the administrator.
pub const FIRST_TABLE_ID: u32 = 1;
/// Last table id handed out; 253 to 255 are the kernel's default, main and
/// local tables.
pub const LAST_TABLE_ID: u32 = 252;

#[derive(Debug, Clone, PartialEq)]
struct InstalledRoute {
    if_index: u32,
    entry: RouteEntry,
}

#[derive(Debug, Default)]
struct State {
    allocated: BTreeSet<u32>,
    routes: Vec<InstalledRoute>,
    default_routes: HashMap<u32, RouteEntry>,
    rules: Vec<(u32, RuleEntry)>,
}

pub struct KernelRoutingTable {
    requests: RequestSender,
    state: Mutex<State>,
}

impl KernelRoutingTable {
    pub fn new(requests: RequestSender) -> Self {
        Self {
            requests,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, request: NetlinkRequest) -> bool {
        match self.requests.send(request) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(request = ?error.0, "netlink worker is gone, dropping request");
                false
            }
        }
    }

    fn delete_route(&self, route: &InstalledRoute) {
        self.queue(NetlinkRequest::DeleteRoute(RouteSpec::from_entry(route.if_index, &route.entry)));
    }

    /// Installs the host route for an answered route query and returns it.
    ///
    /// The route pins the queried address to the interface and gateway the
    /// lookup found, in the table the query ran against. It carries the
    /// query's tag so the requester can flush it later.
    pub fn complete_route_query(&self, answer: &RouteAnswer) -> RouteEntry {
        let query = &answer.query;
        let entry = RouteEntry::new(address::host(query.address), answer.gateway, 0, query.table).with_tag(query.tag);
        if !self.add_route(answer.if_index, &entry) {
            tracing::warn!(address = %query.address, if_index = answer.if_index, "failed to pin host route");
        }
        entry
    }

    /// Number of routes and rules currently installed by the daemon.
    pub fn installed(&self) -> (usize, usize) {
        let state = self.state();
        (state.routes.len() + state.default_routes.len(), state.rules.len())
    }

    fn static_route(route: &StaticRoute, metric: u32, table: u32) -> Result<RouteEntry, address::Error> {
        let dst = address::parse_inet(&route.host, route.prefix)?;
        let gateway = address::parse_optional_addr(&route.gateway)?
            .map(|gateway| address::ensure_family(gateway, address::family_of(&dst)))
            .transpose()?;
        Ok(RouteEntry::new(dst, gateway, metric, table))
    }
}

impl RoutingTable for KernelRoutingTable {
    fn alloc_table_id(&self) -> Option<u32> {
        let mut state = self.state();
        let id = (FIRST_TABLE_ID..=LAST_TABLE_ID).find(|id| !state.allocated.contains(id))?;
        state.allocated.insert(id);
        tracing::debug!(table = id, "allocated routing table");
        Some(id)
    }

    fn free_table_id(&self, table: u32) {
        let (was_allocated, stale) = {
            let mut state = self.state();
            let was_allocated = state.allocated.remove(&table);
            let (mut stale, kept): (Vec<_>, Vec<_>) = state.routes.drain(..).partition(|r| r.entry.table == table);
            state.routes = kept;
            let defaults: Vec<_> = state
                .default_routes
                .iter()
                .filter(|(_, entry)| entry.table == table)
                .map(|(if_index, _)| *if_index)
                .collect();
            for if_index in defaults {
                if let Some(entry) = state.default_routes.remove(&if_index) {
                    stale.push(InstalledRoute { if_index, entry });
                }
            }
            (was_allocated, stale)
        };
        if !was_allocated {
            tracing::warn!(table, "freeing routing table that was not allocated");
            return;
        }
        for route in &stale {
            self.delete_route(route);
        }
        tracing::debug!(table, flushed = stale.len(), "freed routing table");
    }

    fn add_route(&self, interface_index: u32, entry: &RouteEntry) -> bool {
        if !self.queue(NetlinkRequest::AddRoute(RouteSpec::from_entry(interface_index, entry))) {
            return false;
        }
        self.state().routes.push(InstalledRoute {
            if_index: interface_index,
            entry: entry.clone(),
        });
        true
    }

    fn add_rule(&self, interface_index: u32, entry: &RuleEntry) -> bool {
        if !self.queue(NetlinkRequest::AddRule(entry.clone())) {
            return false;
        }
        self.state().rules.push((interface_index, entry.clone()));
        true
    }

    fn flush_routes(&self, interface_index: u32) {
        let (stale, default) = {
            let mut state = self.state();
            let (stale, kept): (Vec<_>, Vec<_>) =
                state.routes.drain(..).partition(|r| r.if_index == interface_index);
            state.routes = kept;
            (stale, state.default_routes.remove(&interface_index))
        };
        for route in &stale {
            self.delete_route(route);
        }
        if let Some(entry) = default {
            self.delete_route(&InstalledRoute {
                if_index: interface_index,
                entry,
            });
        }
    }

    fn flush_routes_with_tag(&self, tag: i32) {
        let stale = {
            let mut state = self.state();
            let (stale, kept): (Vec<_>, Vec<_>) = state.routes.drain(..).partition(|r| r.entry.tag == tag);
            state.routes = kept;
            stale
        };
        for route in &stale {
            self.delete_route(route);
        }
    }

    fn flush_rules(&self, interface_index: u32) {
        let stale = {
            let mut state = self.state();
            let (stale, kept): (Vec<_>, Vec<_>) = state.rules.drain(..).partition(|(index, _)| *index == interface_index);
            state.rules = kept;
            stale
        };
        for (_, rule) in stale {
            self.queue(NetlinkRequest::DeleteRule(rule));
        }
    }

    fn set_default_route(&self, interface_index: u32, gateway: IpAddr, metric: u32, table: u32) -> bool {
        let entry = RouteEntry::new(address::any(IpFamily::of(&gateway)), Some(gateway), metric, table);
        let previous = self.state().default_routes.remove(&interface_index);
        if let Some(previous) = previous {
            self.delete_route(&InstalledRoute {
                if_index: interface_index,
                entry: previous,
            });
        }
        if !self.queue(NetlinkRequest::AddRoute(RouteSpec::from_entry(interface_index, &entry))) {
            return false;
        }
        self.state().default_routes.insert(interface_index, entry);
        true
    }

    fn set_default_metric(&self, interface_index: u32, metric: u32) {
        let Some(previous) = self.state().default_routes.get(&interface_index).cloned() else {
            tracing::debug!(interface_index, metric, "no default route to change the metric of");
            return;
        };
        if previous.metric == metric {
            return;
        }
        let Some(gateway) = previous.gateway else {
            return;
        };
        // the old route goes first, so only one of the two is ever installed
        self.set_default_route(interface_index, gateway, metric, previous.table);
    }

    fn create_link_route(&self, interface_index: u32, local: &IpInet, gateway: IpAddr, table: u32) -> bool {
        let entry = RouteEntry::new(address::host(gateway), None, 0, table)
            .with_src(*local)
            .with_scope(RouteScope::Link);
        self.add_route(interface_index, &entry)
    }

    fn create_blackhole_route(&self, interface_index: u32, family: IpFamily, metric: u32, table: u32) -> bool {
        let entry = RouteEntry::new(address::any(family), None, metric, table).with_kind(RouteKind::Blackhole);
        self.add_route(interface_index, &entry)
    }

    fn request_route_to_host(
        &self,
        address: IpAddr,
        interface_hint: Option<u32>,
        tag: i32,
        requester: ConnectionHandle,
        table: u32,
    ) -> bool {
        tracing::debug!(%address, ?interface_hint, tag, %requester, table, "requesting route to host");
        self.queue(NetlinkRequest::LookupRoute(RouteQuery {
            address,
            interface_hint,
            tag,
            requester,
            table,
        }))
    }

    fn configure_routes(&self, interface_index: u32, config: &IpConfig, metric: u32, table: u32) -> bool {
        let mut all_installed = true;
        for route in &config.routes {
            match Self::static_route(route, metric, table) {
                Ok(entry) => all_installed &= self.add_route(interface_index, &entry),
                Err(error) => {
                    tracing::warn!(%error, host = %route.host, prefix = route.prefix, "skipping static route");
                    all_installed = false;
                }
            }
        }
        all_installed
    }

    fn flush_cache(&self) -> bool {
        self.queue(NetlinkRequest::FlushCache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use netconnd_lib::connection::ConnectionRegistry;
    use netconnd_lib::device::Technology;
    use netconnd_lib::mocks::MockCollaborators;
    use netconnd_lib::routing::TABLE_MAIN;

    use crate::routing::worker;

    fn table() -> (KernelRoutingTable, mpsc::UnboundedReceiver<NetlinkRequest>) {
        let (tx, rx) = worker::channel();
        (KernelRoutingTable::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NetlinkRequest>) -> Vec<NetlinkRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    fn host_route(dst: &str, tag: i32) -> anyhow::Result<RouteEntry> {
        Ok(RouteEntry::new(address::parse_cidr(dst)?, None, 0, TABLE_MAIN).with_tag(tag))
    }

    #[test]
    fn table_ids_come_from_the_daemon_range() {
        let (table, _rx) = table();
        let ids: Vec<_> = std::iter::from_fn(|| table.alloc_table_id()).collect();
        assert_eq!(ids.len(), (LAST_TABLE_ID - FIRST_TABLE_ID + 1) as usize);
        assert_eq!(ids.first(), Some(&FIRST_TABLE_ID));
        assert_eq!(ids.last(), Some(&LAST_TABLE_ID));
        assert_eq!(table.alloc_table_id(), None);

        table.free_table_id(7);
        assert_eq!(table.alloc_table_id(), Some(7));
    }

    #[test]
    fn freeing_a_table_deletes_its_routes() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let id = table.alloc_table_id().ok_or_else(|| anyhow::anyhow!("no table id"))?;
        let throw = RouteEntry::new(address::parse_cidr("192.0.1.0/24")?, None, 0, id).with_kind(RouteKind::Throw);
        assert!(table.add_route(3, &throw));
        assert!(table.add_route(3, &host_route("10.0.0.1", 3)?));
        drain(&mut rx);

        table.free_table_id(id);

        assert_eq!(
            drain(&mut rx),
            vec![NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &throw))]
        );
        assert_eq!(table.installed(), (1, 0));
        Ok(())
    }

    #[test]
    fn freeing_a_table_deletes_its_default_route() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let id = table.alloc_table_id().ok_or_else(|| anyhow::anyhow!("no table id"))?;
        let gateway = "192.168.1.254".parse::<IpAddr>()?;
        assert!(table.set_default_route(3, gateway, 10, id));
        assert!(table.set_default_route(4, gateway, 10, TABLE_MAIN));
        drain(&mut rx);

        table.free_table_id(id);

        let default = RouteEntry::new(address::any(IpFamily::V4), Some(gateway), 10, id);
        assert_eq!(
            drain(&mut rx),
            vec![NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &default))]
        );
        assert_eq!(table.installed(), (1, 0));
        Ok(())
    }

    #[test]
    fn freeing_an_unknown_table_is_ignored() {
        let (table, mut rx) = table();
        table.free_table_id(42);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn flush_routes_only_touches_the_interface() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let mine = host_route("10.0.0.1", 3)?;
        let other = host_route("10.0.0.2", 4)?;
        table.add_route(3, &mine);
        table.add_route(4, &other);
        table.set_default_route(3, "192.168.1.254".parse::<IpAddr>()?, 1, TABLE_MAIN);
        drain(&mut rx);

        table.flush_routes(3);

        let requests = drain(&mut rx);
        assert_eq!(requests.len(), 2);
        assert!(requests.contains(&NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &mine))));
        assert_eq!(table.installed(), (1, 0));

        // nothing left to delete
        table.flush_routes(3);
        assert!(drain(&mut rx).is_empty());
        Ok(())
    }

    #[test]
    fn flush_with_tag_removes_tagged_routes_everywhere() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let pinned = host_route("203.0.113.7", 9)?;
        table.add_route(3, &pinned);
        table.add_route(3, &host_route("10.0.0.1", 3)?);
        drain(&mut rx);

        table.flush_routes_with_tag(9);

        assert_eq!(
            drain(&mut rx),
            vec![NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &pinned))]
        );
        assert_eq!(table.installed(), (1, 0));
        Ok(())
    }

    #[test]
    fn flush_rules_deletes_the_interface_rules() {
        let (table, mut rx) = table();
        let rule = RuleEntry::new(IpFamily::V4, 10, 8).with_uid(1000);
        table.add_rule(3, &rule);
        table.add_rule(4, &RuleEntry::new(IpFamily::V4, 10, 9));
        drain(&mut rx);

        table.flush_rules(3);

        assert_eq!(drain(&mut rx), vec![NetlinkRequest::DeleteRule(rule)]);
        assert_eq!(table.installed(), (0, 1));
    }

    #[test]
    fn metric_change_replaces_the_default_route() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let gateway = "192.168.1.254".parse::<IpAddr>()?;
        table.set_default_route(3, gateway, 10, TABLE_MAIN);
        let old = RouteEntry::new(address::any(IpFamily::V4), Some(gateway), 10, TABLE_MAIN);
        let new = RouteEntry::new(address::any(IpFamily::V4), Some(gateway), 1, TABLE_MAIN);
        assert_eq!(drain(&mut rx), vec![NetlinkRequest::AddRoute(RouteSpec::from_entry(3, &old))]);

        table.set_default_metric(3, 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &old)),
                NetlinkRequest::AddRoute(RouteSpec::from_entry(3, &new)),
            ]
        );

        table.set_default_metric(3, 1);
        table.set_default_metric(4, 1);
        assert!(drain(&mut rx).is_empty());
        Ok(())
    }

    #[test]
    fn link_and_blackhole_routes() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let local = address::parse_inet("192.168.1.1", 24)?;
        assert!(table.create_link_route(3, &local, "192.168.1.254".parse::<IpAddr>()?, TABLE_MAIN));
        assert!(table.create_blackhole_route(3, IpFamily::V6, 0, 8));

        let requests = drain(&mut rx);
        let [NetlinkRequest::AddRoute(link), NetlinkRequest::AddRoute(blackhole)] = requests.as_slice() else {
            anyhow::bail!("unexpected requests: {requests:?}");
        };
        assert_eq!(link.scope, RouteScope::Link);
        assert_eq!(link.source, Some(local.address()));
        assert_eq!(link.if_index, Some(3));
        assert_eq!(blackhole.kind, RouteKind::Blackhole);
        assert_eq!(blackhole.if_index, None);
        assert_eq!(blackhole.family(), IpFamily::V6);
        assert_eq!(blackhole.table_id, 8);
        Ok(())
    }

    #[test]
    fn static_routes_skip_malformed_entries() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let config = IpConfig {
            routes: vec![
                StaticRoute {
                    host: "10.8.1.7".to_string(),
                    prefix: 16,
                    gateway: "192.168.1.253".to_string(),
                },
                StaticRoute {
                    host: "not-an-address".to_string(),
                    prefix: 16,
                    gateway: String::new(),
                },
                StaticRoute {
                    host: "10.9.0.0".to_string(),
                    prefix: 16,
                    gateway: "2001:db8::1".to_string(),
                },
            ],
            ..IpConfig::default()
        };

        assert!(!table.configure_routes(3, &config, 1, TABLE_MAIN));

        let requests = drain(&mut rx);
        let [NetlinkRequest::AddRoute(route)] = requests.as_slice() else {
            anyhow::bail!("unexpected requests: {requests:?}");
        };
        assert_eq!(route.destination.network(), address::parse_cidr("10.8.0.0/16")?.network());
        assert_eq!(route.gateway, Some("192.168.1.253".parse::<IpAddr>()?));
        assert_eq!(route.metric, 1);
        Ok(())
    }

    #[test]
    fn answered_query_pins_a_tagged_host_route() -> anyhow::Result<()> {
        let (table, mut rx) = table();
        let mut registry = ConnectionRegistry::new(MockCollaborators::new().collaborators());
        let requester = registry.create(5, "tun0", Technology::Vpn, false);
        let address = "203.0.113.7".parse::<IpAddr>()?;

        assert!(table.request_route_to_host(address, None, 5, requester, TABLE_MAIN));
        let requests = drain(&mut rx);
        let [NetlinkRequest::LookupRoute(query)] = requests.as_slice() else {
            anyhow::bail!("unexpected requests: {requests:?}");
        };
        assert_eq!(query.requester, requester);

        let answer = RouteAnswer {
            query: query.clone(),
            if_index: 3,
            gateway: Some("192.168.1.254".parse::<IpAddr>()?),
        };
        let entry = table.complete_route_query(&answer);
        assert_eq!(entry.dst, address::host(address));
        assert_eq!(entry.tag, 5);
        assert_eq!(drain(&mut rx), vec![NetlinkRequest::AddRoute(RouteSpec::from_entry(3, &entry))]);

        // the tag lets the requester remove it again
        table.flush_routes_with_tag(5);
        assert_eq!(drain(&mut rx), vec![NetlinkRequest::DeleteRoute(RouteSpec::from_entry(3, &entry))]);
        Ok(())
    }

    #[test]
    fn closed_worker_refuses_requests() -> anyhow::Result<()> {
        let (table, rx) = table();
        drop(rx);
        assert!(!table.add_route(3, &host_route("10.0.0.1", 3)?));
        assert!(!table.flush_cache());
        assert_eq!(table.installed(), (0, 0));
        Ok(())
    }
}
