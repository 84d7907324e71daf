//! Flow tracking and reconstruction
//!
//! Groups TCP packets into bidirectional flows, reassembles each direction
//! into a byte stream and deframes it into application messages.
//!
//! # Features
//!
//! - Canonical flow keys, independent of packet direction
//! - Open / half-closed / closed lifecycle driven by FIN and RST
//! - Swappable deframing strategy with full re-derivation
//! - Append-only message lists with copy-on-write snapshots
//!
//! # Example
//!
//! ```ignore
//! use flowscribe::flow::{FlowConfig, FlowManager, FlowStore};
//!
//! let manager = FlowManager::new(FlowStore::new(FlowConfig::default()));
//! let events = manager.subscribe(None);
//!
//! manager.ingest(packet);
//! for key in manager.list_flows() {
//!     let messages = manager.messages(&key);
//! }
//! ```

pub mod key;
pub mod role;
pub mod state;
pub mod table;
pub mod tracker;

pub use key::{FlowEndpoint, FlowKey};
pub use role::TcpRole;
pub use state::{Flow, FlowPacket, FlowStatus, FlowSummary};
pub use table::FlowStore;
pub use tracker::{FlowEvent, FlowManager, IngestOutcome};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::types::Direction;

/// Minimum per-direction reassembly limit (64 KB)
pub const MIN_STREAM_BYTES: usize = 64 * 1024;
/// Default per-direction reassembly limit (16 MB)
pub const DEFAULT_STREAM_BYTES: usize = 16 * 1024 * 1024;

/// Configuration for flow tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum concurrent flows; the least recently active is evicted beyond this
    pub max_flows: usize,

    /// Maximum reassembled bytes per direction
    pub max_stream_bytes: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_flows: 100_000,
            max_stream_bytes: DEFAULT_STREAM_BYTES,
        }
    }
}

impl FlowConfig {
    /// Reassembly limit, never below the 64 KB floor
    pub fn stream_limit(&self) -> usize {
        self.max_stream_bytes.max(MIN_STREAM_BYTES)
    }
}

/// Flow tracking statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Total flows created
    pub flows_created: u64,
    /// Flows dropped by idle eviction or capacity
    pub flows_evicted: u64,
    /// Current active flows
    pub active_flows: usize,
    /// Packets offered to the manager
    pub packets_processed: u64,
    /// Payload bytes of accepted packets
    pub bytes_processed: u64,
    /// Packets that failed validation
    pub packets_malformed: u64,
    /// Packets dropped before reaching a flow
    pub packets_dropped: u64,
    /// Packets skipped by protocol or port filter
    pub packets_ignored: u64,
    pub messages_emitted: u64,
    /// Full re-derivations after a deframer change
    pub rederivations: u64,
}

/// A problem recorded against a flow, or against the store when no flow applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    pub direction: Option<Direction>,
    pub error: FlowError,
}

impl Diagnostic {
    pub fn new(timestamp: DateTime<Utc>, direction: Option<Direction>, error: FlowError) -> Self {
        Self {
            timestamp,
            direction,
            error,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Some(dir) => write!(f, "[{}] {}", dir, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Cancellation signal for in-flight deframing
///
/// Captures the session generation at creation; the token trips once
/// the generation moves on (clear, stop, target change).
#[derive(Debug, Clone)]
pub struct CancelToken {
    session: Arc<AtomicU64>,
    generation: u64,
}

impl CancelToken {
    pub fn new(session: Arc<AtomicU64>) -> Self {
        let generation = session.load(Ordering::Acquire);
        Self {
            session,
            generation,
        }
    }

    /// Token that never trips
    pub fn never() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)))
    }

    /// Token that is already tripped
    pub fn cancelled() -> Self {
        let session = Arc::new(AtomicU64::new(0));
        let token = Self::new(Arc::clone(&session));
        session.fetch_add(1, Ordering::AcqRel);
        token
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.load(Ordering::Acquire) != self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
