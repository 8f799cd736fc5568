pub mod address;
pub mod config;
pub mod connection;
pub mod device;
pub mod ipconfig;
pub mod logging;
pub mod resolver;
pub mod routing;
pub mod rtnl;

#[cfg(any(test, feature = "test-util"))]
pub mod mocks;

pub mod prelude {
    pub use crate::connection::{Connection, ConnectionBinder, ConnectionHandle, ConnectionRegistry};
    pub use crate::ipconfig::IpConfig;
}
