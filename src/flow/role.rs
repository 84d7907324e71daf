//! TCP segment role classification

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TcpFlags;

/// Semantic role of a TCP segment, derived from its control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TcpRole {
    Syn,
    SynAck,
    Fin,
    FinAck,
    Rst,
    Psh,
    Urg,
    Ack,
    Other,
}

impl TcpRole {
    /// Map flags to a role. First match wins:
    ///
    /// 1. SYN without ACK → `Syn`
    /// 2. SYN with ACK → `SynAck`
    /// 3. FIN with ACK → `FinAck`
    /// 4. FIN without ACK → `Fin`
    /// 5. RST → `Rst`
    /// 6. PSH → `Psh`
    /// 7. URG → `Urg`
    /// 8. ACK → `Ack`
    /// 9. anything else → `Other`
    pub fn classify(flags: &TcpFlags) -> Self {
        match flags {
            TcpFlags { syn: true, ack: false, .. } => TcpRole::Syn,
            TcpFlags { syn: true, ack: true, .. } => TcpRole::SynAck,
            TcpFlags { fin: true, ack: true, .. } => TcpRole::FinAck,
            TcpFlags { fin: true, ack: false, .. } => TcpRole::Fin,
            TcpFlags { rst: true, .. } => TcpRole::Rst,
            TcpFlags { psh: true, .. } => TcpRole::Psh,
            TcpFlags { urg: true, .. } => TcpRole::Urg,
            TcpFlags { ack: true, .. } => TcpRole::Ack,
            _ => TcpRole::Other,
        }
    }

    pub fn is_fin(self) -> bool {
        matches!(self, TcpRole::Fin | TcpRole::FinAck)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TcpRole::Syn => "SYN",
            TcpRole::SynAck => "SYN-ACK",
            TcpRole::Fin => "FIN",
            TcpRole::FinAck => "FIN-ACK",
            TcpRole::Rst => "RST",
            TcpRole::Psh => "PSH",
            TcpRole::Urg => "URG",
            TcpRole::Ack => "ACK",
            TcpRole::Other => "OTHER",
        }
    }
}

impl fmt::Display for TcpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
