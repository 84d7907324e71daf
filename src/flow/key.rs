//! Flow identity
//!
//! A [`FlowKey`] is the unordered pair of a conversation's two endpoints,
//! stored in canonical (sorted) order so that both directions of the same
//! conversation hash to the same key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// One side of a conversation
///
/// Equality, ordering and hashing use `(address, port)` only; the link-layer
/// address is carried for display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowEndpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub mac: Option<[u8; 6]>,
}

impl FlowEndpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port, mac: None }
    }

    pub fn with_mac(mut self, mac: Option<[u8; 6]>) -> Self {
        self.mac = mac;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn mac_string(&self) -> Option<String> {
        self.mac.map(|m| {
            format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            )
        })
    }
}

impl From<SocketAddr> for FlowEndpoint {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip(), sa.port())
    }
}

impl PartialEq for FlowEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl Eq for FlowEndpoint {}

impl Hash for FlowEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for FlowEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.addr, self.port).cmp(&(other.addr, other.port))
    }
}

impl fmt::Display for FlowEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Canonical identity of a bidirectional conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    /// Lower endpoint
    low: FlowEndpoint,
    /// Higher endpoint
    high: FlowEndpoint,
}

impl FlowKey {
    /// Build the key for two endpoints; commutative in its arguments.
    ///
    /// Fails when both endpoints share address and port.
    pub fn new(a: FlowEndpoint, b: FlowEndpoint) -> Result<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Ok(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => Err(FlowError::InvalidFlowKey(a.to_string())),
        }
    }

    pub fn low(&self) -> &FlowEndpoint {
        &self.low
    }

    pub fn high(&self) -> &FlowEndpoint {
        &self.high
    }

    pub fn contains(&self, endpoint: &FlowEndpoint) -> bool {
        self.low == *endpoint || self.high == *endpoint
    }

    /// The endpoint opposite to `endpoint`, if it belongs to this key
    pub fn peer_of(&self, endpoint: &FlowEndpoint) -> Option<&FlowEndpoint> {
        if self.low == *endpoint {
            Some(&self.high)
        } else if self.high == *endpoint {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn involves_port(&self, port: u16) -> bool {
        self.low.port == port || self.high.port == port
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.low, self.high)
    }
}
