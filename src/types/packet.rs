//! Captured packet representation
//!
//! A [`BasicPacket`] is one captured frame reduced to the fields the flow
//! engine needs: addressing, link-layer addresses, transport headers and the
//! transport payload. Packets are immutable once built; the flow store keeps
//! them behind an `Arc`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::key::FlowEndpoint;
use crate::flow::role::TcpRole;

/// Minimum TCP header length in 32-bit words
pub const TCP_MIN_DATA_OFFSET: u8 = 5;
/// Maximum TCP header length in 32-bit words
pub const TCP_MAX_DATA_OFFSET: u8 = 15;

/// Direction of a packet relative to a flow's reference endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the reference endpoint
    Outgoing,
    /// Sent to the reference endpoint
    Incoming,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Outgoing, Direction::Incoming];

    /// Index into per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "out"),
            Direction::Incoming => write!(f, "in"),
        }
    }
}

/// Transport protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl From<u8> for TransportProtocol {
    fn from(n: u8) -> Self {
        match n {
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            1 | 58 => TransportProtocol::Icmp,
            n => TransportProtocol::Other(n),
        }
    }
}

/// The six TCP control flags the engine cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn to_u8(self) -> u8 {
        (self.fin as u8)
            | (self.syn as u8) << 1
            | (self.rst as u8) << 2
            | (self.psh as u8) << 3
            | (self.ack as u8) << 4
            | (self.urg as u8) << 5
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
            (self.urg, "URG"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if set.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// TCP header fields carried with each TCP packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpHeaders {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Header length in 32-bit words
    pub data_offset: u8,
    /// Total IP packet length as declared by the IP header
    pub total_length: u16,
    pub checksum: u16,
}

impl TcpHeaders {
    /// Semantic role, always recomputed from the flags
    pub fn role(&self) -> TcpRole {
        TcpRole::classify(&self.flags)
    }

    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }
}

/// Protocol-specific header union
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportHeaders {
    Tcp(TcpHeaders),
    Udp { length: u16 },
    None,
}

/// One captured packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicPacket {
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_mac: Option<[u8; 6]>,
    pub dst_mac: Option<[u8; 6]>,
    pub protocol: TransportProtocol,
    pub headers: TransportHeaders,
    /// Transport payload; empty for pure control segments
    pub payload: Vec<u8>,
}

impl BasicPacket {
    /// Build a TCP packet with consistent header lengths
    pub fn tcp(src: SocketAddr, dst: SocketAddr, flags: TcpFlags, payload: &[u8]) -> Self {
        let ip_header = if src.is_ipv4() { 20 } else { 40 };
        let total = ip_header + (TCP_MIN_DATA_OFFSET as usize * 4) + payload.len();
        Self {
            timestamp: Utc::now(),
            src_ip: src.ip(),
            dst_ip: dst.ip(),
            src_port: src.port(),
            dst_port: dst.port(),
            src_mac: None,
            dst_mac: None,
            protocol: TransportProtocol::Tcp,
            headers: TransportHeaders::Tcp(TcpHeaders {
                flags,
                data_offset: TCP_MIN_DATA_OFFSET,
                total_length: total.min(u16::MAX as usize) as u16,
                window: 65535,
                ..Default::default()
            }),
            payload: payload.to_vec(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_seq(mut self, seq: u32, ack: u32) -> Self {
        if let TransportHeaders::Tcp(tcp) = &mut self.headers {
            tcp.seq = seq;
            tcp.ack = ack;
        }
        self
    }

    pub fn with_macs(mut self, src: [u8; 6], dst: [u8; 6]) -> Self {
        self.src_mac = Some(src);
        self.dst_mac = Some(dst);
        self
    }

    pub fn src_endpoint(&self) -> FlowEndpoint {
        FlowEndpoint::new(self.src_ip, self.src_port).with_mac(self.src_mac)
    }

    pub fn dst_endpoint(&self) -> FlowEndpoint {
        FlowEndpoint::new(self.dst_ip, self.dst_port).with_mac(self.dst_mac)
    }

    pub fn tcp_headers(&self) -> Option<&TcpHeaders> {
        match &self.headers {
            TransportHeaders::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == TransportProtocol::Tcp
    }

    pub fn role(&self) -> Option<TcpRole> {
        self.tcp_headers().map(TcpHeaders::role)
    }

    pub fn touches_port(&self, port: u16) -> bool {
        self.src_port == port || self.dst_port == port
    }

    /// Check header fields against the declared protocol
    pub fn check(&self) -> Result<()> {
        let tcp = match (&self.protocol, &self.headers) {
            (TransportProtocol::Tcp, TransportHeaders::Tcp(tcp)) => tcp,
            (TransportProtocol::Tcp, _) => {
                return Err(FlowError::MalformedPacket(
                    "TCP packet without TCP headers".into(),
                ))
            }
            _ => return Ok(()),
        };

        if !(TCP_MIN_DATA_OFFSET..=TCP_MAX_DATA_OFFSET).contains(&tcp.data_offset) {
            return Err(FlowError::MalformedPacket(format!(
                "TCP data offset {} outside {}..={}",
                tcp.data_offset, TCP_MIN_DATA_OFFSET, TCP_MAX_DATA_OFFSET
            )));
        }

        let ip_header = if self.src_ip.is_ipv4() { 20 } else { 40 };
        let needed = ip_header + tcp.header_len() + self.payload.len();
        if (tcp.total_length as usize) < needed {
            return Err(FlowError::MalformedPacket(format!(
                "total length {} shorter than headers + payload ({})",
                tcp.total_length, needed
            )));
        }

        if tcp.flags.syn && tcp.flags.fin {
            return Err(FlowError::MalformedPacket("SYN and FIN both set".into()));
        }

        Ok(())
    }
}
