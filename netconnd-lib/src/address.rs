//! Address helpers on top of [`cidr::IpInet`].
//!
//! An [`IpInet`] keeps the host bits of the address together with the prefix
//! length, which is exactly what an interface address needs. "Unset" addresses
//! are modelled as `Option::None` by the callers.

use cidr::IpInet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid prefix length {prefix} for address {address}")]
    InvalidPrefix { address: IpAddr, prefix: u8 },
    #[error("address {address} does not belong to the {family} family")]
    FamilyMismatch { address: IpAddr, family: IpFamily },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[serde(alias = "ipv4")]
    V4,
    #[serde(alias = "ipv6")]
    V6,
}

impl IpFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn max_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

pub fn family_of(inet: &IpInet) -> IpFamily {
    IpFamily::of(&inet.address())
}

/// Parses a bare address string.
pub fn parse_addr(address: &str) -> Result<IpAddr, Error> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// Parses an optional address: the empty string means "unset".
pub fn parse_optional_addr(address: &str) -> Result<Option<IpAddr>, Error> {
    if address.trim().is_empty() {
        Ok(None)
    } else {
        parse_addr(address).map(Some)
    }
}

/// Combines an address string with a prefix length.
///
/// A prefix of `0` on a host address is treated as "no prefix given" and
/// becomes the family's maximum, the way interface configs leave it unset.
pub fn parse_inet(address: &str, prefix: u8) -> Result<IpInet, Error> {
    let addr = parse_addr(address)?;
    let prefix = if prefix == 0 { IpFamily::of(&addr).max_prefix() } else { prefix };
    IpInet::new(addr, prefix).map_err(|_| Error::InvalidPrefix { address: addr, prefix })
}

/// Parses `a.b.c.d/len` or a bare address (a host network).
pub fn parse_cidr(value: &str) -> Result<IpInet, Error> {
    match value.trim().split_once('/') {
        Some((address, prefix)) => {
            let addr = parse_addr(address)?;
            let prefix = prefix
                .parse::<u8>()
                .map_err(|_| Error::InvalidAddress(value.to_string()))?;
            IpInet::new(addr, prefix).map_err(|_| Error::InvalidPrefix { address: addr, prefix })
        }
        None => parse_addr(value).map(IpInet::new_host),
    }
}

/// Checks that `address` belongs to `family`.
pub fn ensure_family(address: IpAddr, family: IpFamily) -> Result<IpAddr, Error> {
    if IpFamily::of(&address) == family {
        Ok(address)
    } else {
        Err(Error::FamilyMismatch { address, family })
    }
}

/// Host network (maximum prefix) for a single address.
pub fn host(address: IpAddr) -> IpInet {
    IpInet::new_host(address)
}

/// The `0/0` network of a family.
pub fn any(family: IpFamily) -> IpInet {
    // a zero length prefix is valid for every family
    IpInet::new(family.unspecified(), 0).unwrap_or_else(|_| IpInet::new_host(family.unspecified()))
}

/// Whether `remote` lives inside the subnet of `local`.
pub fn can_reach(local: &IpInet, remote: &IpAddr) -> bool {
    IpFamily::of(remote) == family_of(local) && local.network().contains(remote)
}

/// Directed broadcast address of an IPv4 subnet.
pub fn default_broadcast(local: &IpInet) -> Option<IpAddr> {
    match local.address() {
        IpAddr::V4(_) => Some(local.network().last_address()),
        IpAddr::V6(_) => None,
    }
}

/// Network in CIDR notation, `1.2.3.4/24` becomes `1.2.3.0/24`.
pub fn subnet_name(local: &IpInet) -> String {
    format!("{}/{}", local.network().first_address(), local.network_length())
}

/// An ordered set of addresses whose members can be enumerated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressSet {
    addresses: BTreeSet<IpAddr>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: IpAddr) -> bool {
        self.addresses.insert(address)
    }

    pub fn remove(&mut self, address: &IpAddr) -> bool {
        self.addresses.remove(address)
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.addresses.contains(address)
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.addresses.iter()
    }
}

impl FromIterator<IpAddr> for AddressSet {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}
