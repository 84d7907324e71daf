//! flowscribe: TCP flow reconstruction and layered protocol deframing
//!
//! Packets go in through [`FlowManager::ingest`]; each bidirectional TCP
//! conversation becomes a [`Flow`] whose directions are reassembled and
//! cut into [`ReassembledMessage`]s by the active deframing strategy.
//!
//! ## Modules
//!
//! - [`types`] - packet model and frame decoding
//! - [`flow`] - flow keys, store, lifecycle and the manager
//! - [`stream`] - per-direction byte stream reassembly
//! - [`deframe`] - Raw, HTTP, HTTPS (key log) and length-prefixed deframers
//! - [`render`] - message renderers keyed by message kind
//! - [`capture`] - pcap replay and packet sources
//! - [`config`] - TOML configuration

pub mod capture;
pub mod config;
pub mod deframe;
pub mod error;
pub mod flow;
pub mod message;
pub mod process;
pub mod render;
pub mod stream;
pub mod types;

pub use capture::{run_capture, CaptureSource, CaptureStats, PcapFileCapture, VecCapture};
pub use config::Config;
pub use deframe::DeframerConfig;
pub use error::{FlowError, FramingError, Result};
pub use flow::{
    Flow, FlowConfig, FlowEndpoint, FlowEvent, FlowKey, FlowManager, FlowStatus, FlowStore,
    IngestOutcome,
};
pub use message::{DisplayEncoding, MessageKind, ReassembledMessage};
pub use render::RendererRegistry;
pub use types::{BasicPacket, Direction};
