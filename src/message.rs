//! Reassembled application messages
//!
//! A [`ReassembledMessage`] is what the presentation layer consumes: one
//! deframed unit of one direction of a flow, with its position in the
//! flow's timeline.

use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::FlowKey;
use crate::types::Direction;

/// What a message contains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Opaque bytes, one packet's worth (raw deframing)
    Data,
    /// Complete HTTP/1.x request
    HttpRequest,
    /// Complete HTTP/1.x response
    HttpResponse,
    /// Bytes that did not look like HTTP, emitted as-is
    Fallback,
    /// Trailing bytes flushed when the flow closed mid-message
    Partial,
    /// Length-prefixed frame, with the optional type discriminator
    Framed { type_tag: Option<u64> },
    /// Undecodable content; payload holds the error text
    Error {
        reason: String,
        expected_key: Option<String>,
    },
}

/// Tag used to pick a renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Data,
    Http,
    Fallback,
    Partial,
    Framed,
    Error,
}

impl MessageKind {
    pub fn tag(&self) -> MessageTag {
        match self {
            MessageKind::Data => MessageTag::Data,
            MessageKind::HttpRequest | MessageKind::HttpResponse => MessageTag::Http,
            MessageKind::Fallback => MessageTag::Fallback,
            MessageKind::Partial => MessageTag::Partial,
            MessageKind::Framed { .. } => MessageTag::Framed,
            MessageKind::Error { .. } => MessageTag::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MessageKind::Error { .. })
    }
}

/// How a payload is best shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayEncoding {
    Hex,
    Ascii,
    Structured,
}

impl DisplayEncoding {
    /// Structured for HTTP, ASCII for printable text and errors, hex otherwise
    pub fn derive(kind: &MessageKind, payload: &[u8]) -> Self {
        match kind {
            MessageKind::HttpRequest | MessageKind::HttpResponse => DisplayEncoding::Structured,
            MessageKind::Error { .. } => DisplayEncoding::Ascii,
            _ if is_mostly_text(payload) => DisplayEncoding::Ascii,
            _ => DisplayEncoding::Hex,
        }
    }
}

fn is_mostly_text(payload: &[u8]) -> bool {
    if payload.is_empty() || std::str::from_utf8(payload).is_err() {
        return false;
    }
    let printable = payload
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace() || **b >= 0x80)
        .count();
    printable * 10 >= payload.len() * 9
}

/// One deframed application message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassembledMessage {
    pub flow: FlowKey,
    pub flow_id: u64,
    pub direction: Direction,
    /// Position within the flow, both directions interleaved
    pub index: u64,
    /// Byte range of the whole frame in the deframed stream
    pub range: Range<usize>,
    pub payload: Vec<u8>,
    pub kind: MessageKind,
    pub encoding: DisplayEncoding,
    /// Capture time of the packet that completed the message
    pub timestamp: DateTime<Utc>,
    /// Gap since the previous message of the flow
    pub interval: Duration,
}

impl ReassembledMessage {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
