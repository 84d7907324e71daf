use thiserror::Error;

/// Errors that can be attached to a flow or a packet.
///
/// None of these ever abort ingestion; the manager records them as
/// [`Diagnostic`](crate::flow::Diagnostic) values on the offending flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("invalid flow key: both endpoints are {0}")]
    InvalidFlowKey(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("decryption unavailable: {reason}")]
    DecryptionUnavailable {
        /// Key identifier (hex client random) that was looked up, if known.
        expected_key: Option<String>,
        reason: String,
    },

    #[error("packet parse error: {0}")]
    Parse(String),

    #[error("reassembly buffer full: {limit} bytes")]
    StreamOverflow { limit: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown flow: {0}")]
    UnknownFlow(String),
}

/// Deframer failures that freeze one direction of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("zero length prefix at offset {offset}")]
    ZeroLength { offset: usize },

    #[error("declared length {declared} at offset {offset} exceeds ceiling {max}")]
    LengthExceedsCeiling {
        offset: usize,
        declared: u64,
        max: u64,
    },

    #[error("declared length {declared} at offset {offset} is shorter than the {header_len}-byte header")]
    LengthBelowHeader {
        offset: usize,
        declared: u64,
        header_len: usize,
    },

    #[error("record at offset {offset} has content type {content_type:#04x}, not TLS")]
    NotTls { offset: usize, content_type: u8 },

    #[error("invalid deframer config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
