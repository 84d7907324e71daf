//! Deframing: recovering application message boundaries from a stream
//!
//! The active strategy is a closed set ([`DeframerConfig`]); each direction of
//! a flow owns a matching [`DeframeState`] that remembers how far it has read.
//! Deframing is incremental: calling [`DeframeState::deframe`] again after the
//! stream grew only yields the frames that completed since the last call.
//!
//! # Example
//!
//! ```ignore
//! use flowscribe::deframe::{DeframerConfig, DeframeState, DeframeContext};
//!
//! let mut state = DeframeState::new(&DeframerConfig::Http);
//! let out = state.deframe(stream.view(), &mut ctx);
//! for frame in out.frames {
//!     println!("{:?} {:?}", frame.kind, frame.range);
//! }
//! ```

pub mod http;
pub mod length_prefixed;
pub mod raw;
pub mod tls;

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FramingError};
use crate::flow::CancelToken;
use crate::message::MessageKind;
use crate::stream::StreamView;
use crate::types::Direction;

pub use http::{HttpDeframer, HttpExchange};
pub use length_prefixed::{Endian, LengthPrefixConfig, LengthPrefixedDeframer, TypeField};
pub use raw::RawDeframer;
pub use tls::{
    HttpsDeframer, KeyLog, KeyLogProvider, SessionSecrets, TlsRecord, TlsRecordDecryptor,
    TlsSession,
};

/// Selectable deframing strategy and its configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeframerConfig {
    /// One message per packet
    #[default]
    Raw,
    /// HTTP/1.x message boundaries
    Http,
    /// TLS records decrypted with key-log material, then HTTP boundaries
    HttpsWithKeyLog {
        #[serde(default)]
        key_log_path: Option<PathBuf>,
    },
    /// Length-prefixed binary frames
    LengthPrefixed(LengthPrefixConfig),
}

impl DeframerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            DeframerConfig::Raw => "raw",
            DeframerConfig::Http => "http",
            DeframerConfig::HttpsWithKeyLog { .. } => "https_with_key_log",
            DeframerConfig::LengthPrefixed(_) => "length_prefixed",
        }
    }

    pub fn validate(&self) -> Result<(), FramingError> {
        match self {
            DeframerConfig::LengthPrefixed(cfg) => cfg.validate(),
            _ => Ok(()),
        }
    }

    pub fn uses_key_log(&self) -> bool {
        matches!(self, DeframerConfig::HttpsWithKeyLog { .. })
    }
}

/// One deframed unit, before it is numbered and timed by the flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Byte range of the frame in the stream it was cut from
    pub range: Range<usize>,
    pub payload: Vec<u8>,
    pub kind: MessageKind,
    pub completed_at: DateTime<Utc>,
    /// Flow packet index of the packet that delivered the last byte
    pub packet_index: usize,
}

impl Frame {
    /// Cut `range` out of `view`; `None` for an empty range
    pub fn cut(view: StreamView<'_>, range: Range<usize>, kind: MessageKind) -> Option<Frame> {
        let payload = view.bytes.get(range.clone())?.to_vec();
        Frame::with_payload(view, range, payload, kind)
    }

    /// Frame over `range` whose payload differs from the raw bytes
    pub fn with_payload(
        view: StreamView<'_>,
        range: Range<usize>,
        payload: Vec<u8>,
        kind: MessageKind,
    ) -> Option<Frame> {
        let segment = view.segment_at(range.end.checked_sub(1)?)?;
        Some(Frame {
            range,
            payload,
            kind,
            completed_at: segment.timestamp,
            packet_index: segment.packet_index,
        })
    }
}

/// Result of one deframe pass
#[derive(Debug, Default)]
pub struct DeframeOutput {
    pub frames: Vec<Frame>,
    /// Newly raised error for this direction, if any
    pub error: Option<FlowError>,
}

/// Collaborators and flags shared by one deframe pass
pub struct DeframeContext<'a> {
    pub direction: Direction,
    /// Flow is closed; held-back bytes must be flushed
    pub final_pass: bool,
    pub cancel: &'a CancelToken,
    pub tls: &'a mut TlsSession,
    /// Outstanding HTTP requests of the flow
    pub exchange: &'a mut HttpExchange,
    pub key_log: Option<&'a Arc<dyn KeyLogProvider>>,
    pub decryptor: Option<&'a Arc<dyn TlsRecordDecryptor>>,
}

/// Per-direction deframing state, one variant per strategy
#[derive(Debug)]
pub enum DeframeState {
    Raw(RawDeframer),
    Http(HttpDeframer),
    Https(HttpsDeframer),
    LengthPrefixed(LengthPrefixedDeframer),
}

impl DeframeState {
    pub fn new(config: &DeframerConfig) -> Self {
        match config {
            DeframerConfig::Raw => DeframeState::Raw(RawDeframer::new()),
            DeframerConfig::Http => DeframeState::Http(HttpDeframer::new()),
            DeframerConfig::HttpsWithKeyLog { .. } => DeframeState::Https(HttpsDeframer::new()),
            DeframerConfig::LengthPrefixed(cfg) => {
                DeframeState::LengthPrefixed(LengthPrefixedDeframer::new(cfg.clone()))
            }
        }
    }

    /// Emit frames that completed since the previous call
    pub fn deframe(&mut self, view: StreamView<'_>, ctx: &mut DeframeContext<'_>) -> DeframeOutput {
        match self {
            DeframeState::Raw(d) => d.deframe(view, ctx),
            DeframeState::Http(d) => d.deframe(view, ctx),
            DeframeState::Https(d) => d.deframe(view, ctx),
            DeframeState::LengthPrefixed(d) => d.deframe(view, ctx),
        }
    }

    /// Framing error that stopped this direction
    pub fn frozen(&self) -> Option<&FramingError> {
        match self {
            DeframeState::Raw(_) | DeframeState::Http(_) => None,
            DeframeState::Https(d) => d.frozen(),
            DeframeState::LengthPrefixed(d) => d.frozen(),
        }
    }

    /// Bytes of the input stream consumed so far
    pub fn cursor(&self) -> usize {
        match self {
            DeframeState::Raw(d) => d.cursor(),
            DeframeState::Http(d) => d.cursor(),
            DeframeState::Https(d) => d.cursor(),
            DeframeState::LengthPrefixed(d) => d.cursor(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::stream::StreamReassembler;
    use chrono::TimeZone;

    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub fn stream_of(chunks: &[&[u8]]) -> StreamReassembler {
        let mut stream = StreamReassembler::new(1 << 20);
        for (i, chunk) in chunks.iter().enumerate() {
            stream.feed(chunk, ts(i as i64 + 1), i).unwrap();
        }
        stream
    }

    pub fn run(
        state: &mut DeframeState,
        stream: &mut StreamReassembler,
        final_pass: bool,
    ) -> DeframeOutput {
        let mut exchange = HttpExchange::default();
        run_with(state, stream, Direction::Outgoing, &mut exchange, final_pass)
    }

    pub fn run_with(
        state: &mut DeframeState,
        stream: &mut StreamReassembler,
        direction: Direction,
        exchange: &mut HttpExchange,
        final_pass: bool,
    ) -> DeframeOutput {
        let cancel = CancelToken::never();
        let mut tls = TlsSession::default();
        let mut ctx = DeframeContext {
            direction,
            final_pass,
            cancel: &cancel,
            tls: &mut tls,
            exchange,
            key_log: None,
            decryptor: None,
        };
        state.deframe(stream.view(), &mut ctx)
    }
}
