//! Kernel side of the routing collaborators.
//!
//! [`KernelRoutingTable`] and [`KernelRtnlHandler`] are called synchronously
//! from connections on the main task. They keep their own bookkeeping and
//! queue every kernel mutation as a [`NetlinkRequest`] which a single worker
//! task executes in order through [`NetlinkOps`](netlink_ops::NetlinkOps).

use thiserror::Error;

use std::net::IpAddr;

use crate::shell_command_ext;

pub mod kernel_table;
pub mod netlink_ops;
pub mod rtnl;
pub mod worker;

#[cfg(test)]
pub(crate) mod mocks;

pub use kernel_table::KernelRoutingTable;
pub use rtnl::KernelRtnlHandler;
pub use worker::{NetlinkRequest, RequestSender, RouteAnswer, RouteQuery};

#[derive(Debug, Error)]
pub enum Error {
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("no route to host {0}")]
    NoRoute(IpAddr),
    #[error("{0}")]
    General(String),
}
