//! CIDR networks
//!
//! A [`Network`] is an address plus prefix length with the host bits
//! cleared. Each family has its own key space: a key is the address
//! left-aligned in a `u128` (IPv4 addresses occupy the top 32 bits), so the
//! bit at depth `d` is the `d`-th address bit for both families. The prefix
//! tree keeps one root per [`Family`]; IPv4 never lands in IPv6 space.

use crate::error::{EnrichError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a network or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Address width in bits
    pub fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// An IPv4 or IPv6 network in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Network {
    addr: IpAddr,
    prefix_len: u8,
}

impl Network {
    /// Create a network, clearing host bits
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = Family::of(&addr).bits();
        if prefix_len > max {
            return Err(EnrichError::InvalidNetwork(format!(
                "{}/{}: prefix length exceeds {}",
                addr, prefix_len, max
            )));
        }

        let addr = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_u32(prefix_len))),
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_u128(prefix_len)))
            }
        };
        Ok(Self { addr, prefix_len })
    }

    /// Rebuild a network from a left-aligned key and prefix length
    pub fn from_key(family: Family, key: u128, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(family.bits());
        let key = key & mask_u128(prefix_len);
        let addr = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::from((key >> 96) as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(key)),
        };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Left-aligned key of the network address
    pub fn key(&self) -> u128 {
        address_key(self.addr)
    }

    /// Whether `addr` falls inside this network
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                u32::from(a) & mask_u32(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                u128::from(a) & mask_u128(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl FromStr for Network {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr_str, prefix_str) = s.split_once('/').ok_or_else(|| {
            EnrichError::InvalidNetwork(format!("{:?} is not in CIDR notation", s))
        })?;

        let addr = addr_str
            .parse::<IpAddr>()
            .map_err(|e| EnrichError::InvalidNetwork(format!("{:?}: {}", s, e)))?;
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|e| EnrichError::InvalidNetwork(format!("{:?}: {}", s, e)))?;

        Network::new(addr, prefix_len)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Left-aligned tree key for an address
pub fn address_key(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn mask_u32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix_len))
    }
}

fn mask_u128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        !0u128 << (128 - u32::from(prefix_len))
    }
}
