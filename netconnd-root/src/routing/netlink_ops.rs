//! Abstraction over rtnetlink operations for testability.
//!
//! Defines the [`NetlinkOps`] trait and domain types ([`RouteSpec`],
//! [`AddressSpec`], etc.) that decouple the routing bookkeeping from the raw
//! netlink wire format. Policy rules use [`RuleEntry`] directly.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use cidr::IpInet;

use std::net::IpAddr;

use netconnd_lib::address::{self, IpFamily};
use netconnd_lib::routing::{RouteEntry, RouteKind, RouteScope, RuleEntry};

use super::Error;

#[cfg(target_os = "linux")]
use {
    futures::TryStreamExt,
    rtnetlink::packet_route::AddressFamily,
    rtnetlink::packet_route::address::AddressAttribute,
    rtnetlink::packet_route::link::LinkAttribute,
    rtnetlink::packet_route::route::{
        RouteAddress, RouteAttribute, RouteMessage, RouteScope as NlRouteScope, RouteType,
    },
    rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage, RuleUidRange},
    rtnetlink::{LinkUnspec, RouteMessageBuilder},
    std::net::{Ipv4Addr, Ipv6Addr},
    tokio::process::Command,
};

#[cfg(target_os = "linux")]
use crate::shell_command_ext::ShellCommandExt;

// ============================================================================
// Domain Types
// ============================================================================

/// Route specification decoupled from rtnetlink wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub destination: IpInet,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    /// Unset for blackhole and throw routes, which leave through no interface.
    pub if_index: Option<u32>,
    pub table_id: u32,
    pub metric: u32,
    pub scope: RouteScope,
    pub kind: RouteKind,
}

impl RouteSpec {
    pub fn from_entry(if_index: u32, entry: &RouteEntry) -> Self {
        let if_index = match entry.kind {
            RouteKind::Unicast => Some(if_index),
            RouteKind::Throw | RouteKind::Blackhole => None,
        };
        Self {
            destination: entry.dst,
            source: entry.src.map(|src| src.address()),
            gateway: entry.gateway,
            if_index,
            table_id: entry.table,
            metric: entry.metric,
            scope: entry.scope,
            kind: entry.kind,
        }
    }

    pub fn family(&self) -> IpFamily {
        address::family_of(&self.destination)
    }

    /// Kernel identity of a route: two routes with the same key cannot coexist.
    pub fn same_key(&self, other: &RouteSpec) -> bool {
        self.destination.network() == other.destination.network()
            && self.table_id == other.table_id
            && self.metric == other.metric
    }
}

/// Address to assign to an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressSpec {
    pub if_index: u32,
    pub local: IpInet,
    pub broadcast: Option<IpAddr>,
    pub peer: Option<IpAddr>,
}

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
}

/// Address assigned to an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct AddrInfo {
    pub if_index: u32,
    pub address: IpInet,
}

/// Picks the route the kernel would use for `address` out of a table dump:
/// longest prefix first, then lowest metric. Only unicast routes leaving
/// through an interface qualify; `if_index_hint` restricts the candidates to
/// one interface.
pub fn best_route(routes: &[RouteSpec], address: IpAddr, if_index_hint: Option<u32>) -> Option<&RouteSpec> {
    routes
        .iter()
        .filter(|route| route.kind == RouteKind::Unicast && route.if_index.is_some())
        .filter(|route| route.destination.network().contains(&address))
        .filter(|route| if_index_hint.is_none() || route.if_index == if_index_hint)
        .min_by_key(|route| (std::cmp::Reverse(route.destination.network_length()), route.metric))
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink route/rule/link/address operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Lists routes of one family, restricted to `table_id` when given.
    async fn route_list(&self, family: IpFamily, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleEntry) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleEntry) -> Result<(), Error>;

    async fn addr_add(&self, addr: &AddressSpec) -> Result<(), Error>;
    /// Removes every address of the interface and returns how many were removed.
    async fn addr_flush(&self, if_index: u32) -> Result<usize, Error>;
    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error>;

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn link_set_mtu(&self, if_index: u32, mtu: u32) -> Result<(), Error>;

    /// Drops cached routing decisions of both families.
    async fn flush_cache(&self) -> Result<(), Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[cfg(target_os = "linux")]
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

#[cfg(target_os = "linux")]
fn route_address(address: IpAddr) -> RouteAddress {
    match address {
        IpAddr::V4(ip) => RouteAddress::Inet(ip),
        IpAddr::V6(ip) => RouteAddress::Inet6(ip),
    }
}

#[cfg(target_os = "linux")]
fn ip_from_route_address(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn address_family(family: IpFamily) -> AddressFamily {
    match family {
        IpFamily::V4 => AddressFamily::Inet,
        IpFamily::V6 => AddressFamily::Inet6,
    }
}

#[cfg(target_os = "linux")]
impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_route_message(spec: &RouteSpec) -> Result<RouteMessage, Error> {
        let network = spec.destination.network();
        let mut builder = RouteMessageBuilder::<IpAddr>::new()
            .table_id(spec.table_id)
            .destination_prefix(network.first_address(), network.network_length())
            .map_err(|e| Error::General(format!("invalid route destination {}: {e:?}", spec.destination)))?;
        if let Some(index) = spec.if_index {
            builder = builder.output_interface(index);
        }
        if let Some(gateway) = spec.gateway {
            builder = builder
                .gateway(gateway)
                .map_err(|e| Error::General(format!("invalid route gateway {gateway}: {e:?}")))?;
        }

        let mut msg = builder.build();
        msg.header.scope = match spec.scope {
            RouteScope::Universe => NlRouteScope::Universe,
            RouteScope::Link => NlRouteScope::Link,
            RouteScope::Host => NlRouteScope::Host,
        };
        msg.header.kind = match spec.kind {
            RouteKind::Unicast => RouteType::Unicast,
            RouteKind::Throw => RouteType::Throw,
            RouteKind::Blackhole => RouteType::BlackHole,
        };
        if spec.metric > 0 {
            msg.attributes.push(RouteAttribute::Priority(spec.metric));
        }
        if let Some(source) = spec.source {
            msg.attributes.push(RouteAttribute::PrefSource(route_address(source)));
        }
        Ok(msg)
    }

    fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
        let family = match msg.header.address_family {
            AddressFamily::Inet => IpFamily::V4,
            AddressFamily::Inet6 => IpFamily::V6,
            _ => return None,
        };
        let kind = match msg.header.kind {
            RouteType::Unicast => RouteKind::Unicast,
            RouteType::Throw => RouteKind::Throw,
            RouteType::BlackHole => RouteKind::Blackhole,
            _ => return None,
        };
        let scope = match msg.header.scope {
            NlRouteScope::Link => RouteScope::Link,
            NlRouteScope::Host => RouteScope::Host,
            _ => RouteScope::Universe,
        };

        let mut destination = family.unspecified();
        let mut source = None;
        let mut gateway = None;
        let mut if_index = None;
        let mut table_id = u32::from(msg.header.table);
        let mut metric = 0;
        for attribute in &msg.attributes {
            match attribute {
                RouteAttribute::Destination(addr) => destination = ip_from_route_address(addr)?,
                RouteAttribute::PrefSource(addr) => source = ip_from_route_address(addr),
                RouteAttribute::Gateway(addr) => gateway = ip_from_route_address(addr),
                RouteAttribute::Oif(index) => if_index = Some(*index),
                RouteAttribute::Table(id) => table_id = *id,
                RouteAttribute::Priority(priority) => metric = *priority,
                _ => {}
            }
        }
        let destination = IpInet::new(destination, msg.header.destination_prefix_length).ok()?;

        Some(RouteSpec {
            destination,
            source,
            gateway,
            if_index,
            table_id,
            metric,
            scope,
            kind,
        })
    }

    fn build_rule_message(&self, rule: &RuleEntry) -> RuleMessage {
        let mut req = self
            .handle
            .rule()
            .add()
            .table_id(rule.table)
            .priority(rule.priority)
            .action(RuleAction::ToTable);
        if let Some(iif) = &rule.iif_name {
            req = req.input_interface(iif.clone());
        }

        let msg = req.message_mut();
        msg.header.family = address_family(rule.family);
        if let Some(range) = rule.uid_range {
            msg.attributes.push(RuleAttribute::UidRange(RuleUidRange {
                start: range.start,
                end: range.end,
            }));
        }
        if let Some(src) = rule.src {
            msg.header.src_len = src.network_length();
            msg.attributes.push(RuleAttribute::Source(src.address()));
        }
        msg.clone()
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route)?;
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route)?;
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn route_list(&self, family: IpFamily, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let filter = match family {
            IpFamily::V4 => RouteMessageBuilder::<Ipv4Addr>::default().build(),
            IpFamily::V6 => RouteMessageBuilder::<Ipv6Addr>::default().build(),
        };
        let routes: Vec<_> = self.handle.route().get(filter).execute().try_collect().await?;

        Ok(routes
            .iter()
            .filter_map(Self::route_message_to_spec)
            .filter(|route| table_id.is_none_or(|id| route.table_id == id))
            .collect())
    }

    async fn rule_add(&self, rule: &RuleEntry) -> Result<(), Error> {
        let msg = self.build_rule_message(rule);
        let mut req = self.handle.rule().add();
        *req.message_mut() = msg;
        req.execute().await?;
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleEntry) -> Result<(), Error> {
        let msg = self.build_rule_message(rule);
        self.handle.rule().del(msg).execute().await?;
        Ok(())
    }

    async fn addr_add(&self, addr: &AddressSpec) -> Result<(), Error> {
        let mut req = self
            .handle
            .address()
            .add(addr.if_index, addr.local.address(), addr.local.network_length());
        let msg = req.message_mut();
        if let Some(peer) = addr.peer {
            msg.attributes.retain(|a| !matches!(a, AddressAttribute::Address(_)));
            msg.attributes.push(AddressAttribute::Address(peer));
        }
        msg.attributes.retain(|a| !matches!(a, AddressAttribute::Broadcast(_)));
        if let Some(IpAddr::V4(broadcast)) = addr.broadcast {
            msg.attributes.push(AddressAttribute::Broadcast(broadcast));
        }
        req.execute().await?;
        Ok(())
    }

    async fn addr_flush(&self, if_index: u32) -> Result<usize, Error> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(if_index)
            .execute()
            .try_collect()
            .await?;

        let count = addrs.len();
        for msg in addrs {
            self.handle.address().del(msg).execute().await?;
        }
        Ok(count)
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        let addrs: Vec<_> = self.handle.address().get().execute().try_collect().await?;

        Ok(addrs
            .iter()
            .filter_map(|msg| {
                // point to point links carry the peer in IFA_ADDRESS
                let local = msg.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Local(ip) => Some(*ip),
                    _ => None,
                });
                let ip = local.or_else(|| {
                    msg.attributes.iter().find_map(|a| match a {
                        AddressAttribute::Address(ip) => Some(*ip),
                        _ => None,
                    })
                })?;
                Some(AddrInfo {
                    if_index: msg.header.index,
                    address: IpInet::new(ip, msg.header.prefix_len).ok()?,
                })
            })
            .collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                let mtu = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::Mtu(m) => Some(*m),
                    _ => None,
                });
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                    mtu,
                })
            })
            .collect())
    }

    async fn link_set_mtu(&self, if_index: u32, mtu: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(if_index).mtu(mtu).build())
            .execute()
            .await?;
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), Error> {
        Command::new("ip").args(["route", "flush", "cache"]).run().await?;
        Command::new("ip").args(["-6", "route", "flush", "cache"]).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use netconnd_lib::routing::TABLE_MAIN;

    fn unicast(destination: &str, if_index: u32, metric: u32) -> anyhow::Result<RouteSpec> {
        Ok(RouteSpec {
            destination: address::parse_cidr(destination)?,
            source: None,
            gateway: None,
            if_index: Some(if_index),
            table_id: TABLE_MAIN,
            metric,
            scope: RouteScope::Universe,
            kind: RouteKind::Unicast,
        })
    }

    #[test]
    fn spec_from_entry_drops_interface_of_throw_routes() -> anyhow::Result<()> {
        let entry = RouteEntry::new(address::parse_cidr("192.0.1.0/24")?, None, 0, 8).with_kind(RouteKind::Throw);
        let spec = RouteSpec::from_entry(3, &entry);
        assert_eq!(spec.if_index, None);
        assert_eq!(spec.kind, RouteKind::Throw);
        assert_eq!(spec.table_id, 8);

        let local = address::parse_inet("192.168.1.1", 24)?;
        let entry = RouteEntry::new(address::host("192.168.1.254".parse::<IpAddr>()?), None, 0, 8).with_src(local);
        let spec = RouteSpec::from_entry(3, &entry);
        assert_eq!(spec.if_index, Some(3));
        assert_eq!(spec.source, Some("192.168.1.1".parse::<IpAddr>()?));
        assert_eq!(spec.family(), IpFamily::V4);
        Ok(())
    }

    #[test]
    fn same_key_ignores_host_bits_and_gateway() -> anyhow::Result<()> {
        let a = unicast("10.0.0.0/8", 3, 1)?;
        let mut b = unicast("10.1.2.3/8", 4, 1)?;
        b.gateway = Some("10.0.0.1".parse::<IpAddr>()?);
        assert!(a.same_key(&b));
        b.metric = 10;
        assert!(!a.same_key(&b));
        Ok(())
    }

    #[test]
    fn best_route_prefers_longest_prefix_then_metric() -> anyhow::Result<()> {
        let routes = vec![
            unicast("0.0.0.0/0", 2, 1)?,
            unicast("10.0.0.0/8", 3, 10)?,
            unicast("10.8.0.0/16", 4, 20)?,
            unicast("10.8.0.0/16", 5, 5)?,
        ];
        let best = best_route(&routes, "10.8.1.1".parse::<IpAddr>()?, None);
        assert_eq!(best.and_then(|r| r.if_index), Some(5));

        let best = best_route(&routes, "10.9.1.1".parse::<IpAddr>()?, None);
        assert_eq!(best.and_then(|r| r.if_index), Some(3));

        let best = best_route(&routes, "8.8.8.8".parse::<IpAddr>()?, None);
        assert_eq!(best.and_then(|r| r.if_index), Some(2));
        Ok(())
    }

    #[test]
    fn best_route_honors_interface_hint() -> anyhow::Result<()> {
        let routes = vec![unicast("0.0.0.0/0", 2, 1)?, unicast("10.0.0.0/8", 3, 1)?];
        let best = best_route(&routes, "10.1.1.1".parse::<IpAddr>()?, Some(2));
        assert_eq!(best.and_then(|r| r.if_index), Some(2));
        assert!(best_route(&routes, "10.1.1.1".parse::<IpAddr>()?, Some(7)).is_none());
        Ok(())
    }

    #[test]
    fn best_route_skips_blackholes_and_other_families() -> anyhow::Result<()> {
        let mut blackhole = unicast("10.0.0.0/8", 3, 1)?;
        blackhole.kind = RouteKind::Blackhole;
        blackhole.if_index = None;
        let routes = vec![blackhole, unicast("::/0", 4, 1)?];
        assert!(best_route(&routes, "10.1.1.1".parse::<IpAddr>()?, None).is_none());
        assert!(best_route(&routes, "2001:db8::1".parse::<IpAddr>()?, None).is_some());
        Ok(())
    }
}
