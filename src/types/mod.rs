//! Packet model types
//!
//! ## Key Types
//!
//! - [`BasicPacket`] - one captured packet with parsed addressing and headers
//! - [`TcpHeaders`] - TCP fields; the role is always derived from the flags
//! - [`Direction`] - packet direction relative to a flow's reference endpoint

pub mod packet;
pub mod parser;

pub use packet::{
    BasicPacket, Direction, TcpFlags, TcpHeaders, TransportHeaders, TransportProtocol,
};
pub use parser::{parse_frame, LinkType};
