//! Stateful mock of the netlink layer.
//!
//! The mock tracks the kernel state the daemon would produce (routes, rules,
//! addresses, link MTUs, cache flushes) so tests assert on the resulting
//! state rather than on call sequences.

use async_trait::async_trait;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use netconnd_lib::address::IpFamily;
use netconnd_lib::routing::RuleEntry;

use super::Error;
use super::netlink_ops::{AddrInfo, AddressSpec, LinkInfo, NetlinkOps, RouteSpec};

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleEntry>,
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<AddrInfo>,
    pub cache_flushes: u32,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self::with_state(NetlinkState::default())
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;
        if s.routes.iter().any(|r| r.same_key(route)) {
            return Err(Error::General(format!("route exists: {}", route.destination)));
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;
        let before = s.routes.len();
        s.routes.retain(|r| !r.same_key(route));
        if s.routes.len() == before {
            return Err(Error::General(format!("route not found: {}", route.destination)));
        }
        Ok(())
    }

    async fn route_list(&self, family: IpFamily, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("route_list")?;
        Ok(s.routes
            .iter()
            .filter(|r| r.family() == family)
            .filter(|r| table_id.is_none_or(|id| r.table_id == id))
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleEntry) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        if s.rules.contains(rule) {
            return Err(Error::General(format!("rule exists: priority {}", rule.priority)));
        }
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleEntry) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;
        let Some(position) = s.rules.iter().position(|r| r == rule) else {
            return Err(Error::General(format!("rule not found: priority {}", rule.priority)));
        };
        s.rules.remove(position);
        Ok(())
    }

    async fn addr_add(&self, addr: &AddressSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_add")?;
        s.addrs.push(AddrInfo {
            if_index: addr.if_index,
            address: addr.local,
        });
        Ok(())
    }

    async fn addr_flush(&self, if_index: u32) -> Result<usize, Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_flush")?;
        let before = s.addrs.len();
        s.addrs.retain(|a| a.if_index != if_index);
        Ok(before - s.addrs.len())
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("addr_list")?;
        Ok(s.addrs.clone())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_list")?;
        Ok(s.links.clone())
    }

    async fn link_set_mtu(&self, if_index: u32, mtu: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("link_set_mtu")?;
        let Some(link) = s.links.iter_mut().find(|l| l.index == if_index) else {
            return Err(Error::General(format!("no such link: {if_index}")));
        };
        link.mtu = Some(mtu);
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush_cache")?;
        s.cache_flushes += 1;
        Ok(())
    }
}
