//! Netlink worker task.
//!
//! Collaborators on the main task queue [`NetlinkRequest`]s; [`run`] executes
//! them one at a time in submission order. Route-to-host lookups are answered
//! on a second channel so the main task can hand them to the connection
//! registry.

use tokio::sync::mpsc;

use std::net::IpAddr;

use netconnd_lib::address::IpFamily;
use netconnd_lib::connection::ConnectionHandle;
use netconnd_lib::routing::RuleEntry;

use super::Error;
use super::netlink_ops::{self, AddressSpec, NetlinkOps, RouteSpec};

pub type RequestSender = mpsc::UnboundedSender<NetlinkRequest>;
pub type AnswerSender = mpsc::UnboundedSender<RouteAnswer>;

/// A pending route-to-host lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteQuery {
    pub address: IpAddr,
    pub interface_hint: Option<u32>,
    pub tag: i32,
    pub requester: ConnectionHandle,
    pub table: u32,
}

/// Route found for a [`RouteQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteAnswer {
    pub query: RouteQuery,
    pub if_index: u32,
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetlinkRequest {
    AddRoute(RouteSpec),
    DeleteRoute(RouteSpec),
    AddRule(RuleEntry),
    DeleteRule(RuleEntry),
    AddAddress(AddressSpec),
    FlushAddresses(u32),
    SetMtu { if_index: u32, mtu: u32 },
    LookupRoute(RouteQuery),
    FlushCache,
}

pub fn channel() -> (RequestSender, mpsc::UnboundedReceiver<NetlinkRequest>) {
    mpsc::unbounded_channel()
}

/// Executes queued requests until every sender is gone.
pub async fn run<N: NetlinkOps>(
    ops: N,
    mut requests: mpsc::UnboundedReceiver<NetlinkRequest>,
    answers: AnswerSender,
) {
    while let Some(request) = requests.recv().await {
        let description = format!("{request:?}");
        if let Err(error) = execute(&ops, request, &answers).await {
            tracing::warn!(%error, request = %description, "netlink request failed");
        }
    }
    tracing::debug!("netlink request queue closed");
}

pub async fn execute<N: NetlinkOps>(ops: &N, request: NetlinkRequest, answers: &AnswerSender) -> Result<(), Error> {
    match request {
        NetlinkRequest::AddRoute(route) => ops.route_add(&route).await,
        NetlinkRequest::DeleteRoute(route) => ops.route_del(&route).await,
        NetlinkRequest::AddRule(rule) => ops.rule_add(&rule).await,
        NetlinkRequest::DeleteRule(rule) => ops.rule_del(&rule).await,
        NetlinkRequest::AddAddress(addr) => ops.addr_add(&addr).await,
        NetlinkRequest::FlushAddresses(if_index) => {
            let removed = ops.addr_flush(if_index).await?;
            tracing::debug!(if_index, removed, "flushed interface addresses");
            Ok(())
        }
        NetlinkRequest::SetMtu { if_index, mtu } => ops.link_set_mtu(if_index, mtu).await,
        NetlinkRequest::LookupRoute(query) => lookup_route(ops, query, answers).await,
        NetlinkRequest::FlushCache => ops.flush_cache().await,
    }
}

async fn lookup_route<N: NetlinkOps>(ops: &N, query: RouteQuery, answers: &AnswerSender) -> Result<(), Error> {
    let routes = ops
        .route_list(IpFamily::of(&query.address), Some(query.table))
        .await?;
    let Some(route) = netlink_ops::best_route(&routes, query.address, query.interface_hint) else {
        return Err(Error::NoRoute(query.address));
    };
    let Some(if_index) = route.if_index else {
        return Err(Error::NoRoute(query.address));
    };
    tracing::debug!(address = %query.address, if_index, gateway = ?route.gateway, "route query answered");

    let answer = RouteAnswer {
        gateway: route.gateway,
        if_index,
        query,
    };
    if answers.send(answer).is_err() {
        tracing::debug!("route answer dropped: receiver closed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use netconnd_lib::address;
    use netconnd_lib::connection::ConnectionRegistry;
    use netconnd_lib::device::Technology;
    use netconnd_lib::mocks::MockCollaborators;
    use netconnd_lib::routing::{RouteKind, RouteScope, TABLE_MAIN};

    use crate::routing::mocks::MockNetlinkOps;
    use crate::routing::netlink_ops::LinkInfo;

    fn route(destination: &str, gateway: Option<&str>, if_index: u32) -> anyhow::Result<RouteSpec> {
        Ok(RouteSpec {
            destination: address::parse_cidr(destination)?,
            source: None,
            gateway: gateway.map(|g| g.parse::<IpAddr>()).transpose()?,
            if_index: Some(if_index),
            table_id: TABLE_MAIN,
            metric: 0,
            scope: RouteScope::Universe,
            kind: RouteKind::Unicast,
        })
    }

    fn requester() -> ConnectionHandle {
        let mut registry = ConnectionRegistry::new(MockCollaborators::new().collaborators());
        registry.create(3, "eth0", Technology::Ethernet, false)
    }

    #[tokio::test]
    async fn executes_requests_in_order() -> anyhow::Result<()> {
        let ops = MockNetlinkOps::new();
        let (answer_tx, _answer_rx) = mpsc::unbounded_channel();
        let (tx, rx) = channel();
        let default = route("0.0.0.0/0", Some("192.168.1.254"), 3)?;
        tx.send(NetlinkRequest::AddRoute(default.clone()))?;
        tx.send(NetlinkRequest::DeleteRoute(default.clone()))?;
        tx.send(NetlinkRequest::AddRoute(default.clone()))?;
        tx.send(NetlinkRequest::FlushCache)?;
        drop(tx);

        run(ops.clone(), rx, answer_tx).await;

        let state = ops.state.lock().unwrap();
        assert_eq!(state.routes, vec![default]);
        assert_eq!(state.cache_flushes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_request_does_not_stop_the_worker() -> anyhow::Result<()> {
        let ops = MockNetlinkOps::new();
        let (answer_tx, _answer_rx) = mpsc::unbounded_channel();
        let (tx, rx) = channel();
        // deleting something that was never installed fails
        tx.send(NetlinkRequest::DeleteRoute(route("10.0.0.0/8", None, 3)?))?;
        tx.send(NetlinkRequest::SetMtu { if_index: 3, mtu: 1400 })?;
        tx.send(NetlinkRequest::FlushCache)?;
        drop(tx);

        run(ops.clone(), rx, answer_tx).await;

        assert_eq!(ops.state.lock().unwrap().cache_flushes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn sets_link_mtu() -> anyhow::Result<()> {
        let ops = MockNetlinkOps::new();
        ops.state.lock().unwrap().links.push(LinkInfo {
            index: 3,
            name: "eth0".to_string(),
            mtu: Some(1500),
        });
        let (answer_tx, _answer_rx) = mpsc::unbounded_channel();
        execute(&ops, NetlinkRequest::SetMtu { if_index: 3, mtu: 1400 }, &answer_tx).await?;
        assert_eq!(ops.state.lock().unwrap().links[0].mtu, Some(1400));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_answers_with_the_best_route() -> anyhow::Result<()> {
        let ops = MockNetlinkOps::new();
        {
            let mut state = ops.state.lock().unwrap();
            state.routes.push(route("0.0.0.0/0", Some("192.168.1.254"), 3)?);
            state.routes.push(route("10.0.0.0/8", Some("10.0.0.1"), 4)?);
        }
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
        let query = RouteQuery {
            address: "203.0.113.7".parse::<IpAddr>()?,
            interface_hint: None,
            tag: 5,
            requester: requester(),
            table: TABLE_MAIN,
        };

        execute(&ops, NetlinkRequest::LookupRoute(query.clone()), &answer_tx).await?;

        let answer = answer_rx.try_recv()?;
        assert_eq!(answer.query, query);
        assert_eq!(answer.if_index, 3);
        assert_eq!(answer.gateway, Some("192.168.1.254".parse::<IpAddr>()?));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_without_route_answers_nothing() -> anyhow::Result<()> {
        let ops = MockNetlinkOps::new();
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
        let query = RouteQuery {
            address: "203.0.113.7".parse::<IpAddr>()?,
            interface_hint: None,
            tag: 5,
            requester: requester(),
            table: TABLE_MAIN,
        };

        let result = execute(&ops, NetlinkRequest::LookupRoute(query), &answer_tx).await;

        assert!(matches!(result, Err(Error::NoRoute(_))));
        assert!(answer_rx.try_recv().is_err());
        Ok(())
    }
}
