//! Per-flow state
//!
//! A [`Flow`] owns everything derived from one conversation: the packet
//! list, the two reassembled streams, their deframers and the message list.
//! Mutation goes through one lock per flow; readers take copy-on-write
//! snapshots of the message list without touching that lock.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{CancelToken, Diagnostic, FlowEndpoint, FlowKey, TcpRole};
use crate::deframe::{
    DeframeContext, DeframeState, DeframerConfig, Frame, HttpExchange, KeyLogProvider,
    TlsRecordDecryptor, TlsSession,
};
use crate::error::FlowError;
use crate::message::{DisplayEncoding, ReassembledMessage};
use crate::process::ProcessInfo;
use crate::stream::StreamReassembler;
use crate::types::{BasicPacket, Direction};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Open,
    /// FIN seen from one side
    HalfClosed,
    /// FIN from both sides, or RST
    Closed,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Open => write!(f, "open"),
            FlowStatus::HalfClosed => write!(f, "half-closed"),
            FlowStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A packet as recorded on its flow
#[derive(Debug, Clone)]
pub struct FlowPacket {
    pub direction: Direction,
    pub packet: Arc<BasicPacket>,
}

impl FlowPacket {
    pub fn role(&self) -> Option<TcpRole> {
        self.packet.role()
    }
}

/// Point-in-time description of a flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: u64,
    pub key: FlowKey,
    pub reference: FlowEndpoint,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: FlowStatus,
    /// Packets recorded, indexed by [`Direction::index`]
    pub packets: [usize; 2],
    /// Reassembled bytes, indexed by [`Direction::index`]
    pub bytes: [usize; 2],
    pub messages: usize,
    pub deframer: &'static str,
    pub decryptable: bool,
    pub process: Option<ProcessInfo>,
    pub diagnostics: usize,
}

/// Collaborators for one deframe pass
pub(crate) struct DeframeEnv<'a> {
    pub key_log: Option<&'a Arc<dyn KeyLogProvider>>,
    pub decryptor: Option<&'a Arc<dyn TlsRecordDecryptor>>,
    pub cancel: &'a CancelToken,
}

/// What one packet did to its flow
#[derive(Debug)]
pub(crate) struct IngestResult {
    pub direction: Direction,
    /// Payload reached the reassembler
    pub delivered: bool,
    /// Flow was already closed; packet only recorded
    pub after_close: bool,
    pub malformed: bool,
    pub status_change: Option<FlowStatus>,
    pub messages: Vec<Arc<ReassembledMessage>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl IngestResult {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            delivered: false,
            after_close: false,
            malformed: false,
            status_change: None,
            messages: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct DirectionState {
    stream: StreamReassembler,
    deframe: DeframeState,
    overflowed: bool,
}

#[derive(Debug)]
struct FlowInner {
    packets: Vec<FlowPacket>,
    last_activity: DateTime<Utc>,
    status: FlowStatus,
    fin_seen: [bool; 2],
    dirs: [DirectionState; 2],
    deframer: DeframerConfig,
    /// Deframer was set for this flow only
    deframer_override: bool,
    tls: TlsSession,
    exchange: HttpExchange,
    /// Packet-level problems; survive re-derivation
    diagnostics: Vec<Diagnostic>,
    /// Deframer problems; rebuilt by re-derivation
    deframe_diagnostics: Vec<Diagnostic>,
    next_index: u64,
    last_message_at: Option<DateTime<Utc>>,
}

impl FlowInner {
    /// Run the deframer of one direction over everything it has not consumed,
    /// or only up to its first `upto` segments
    fn deframe_direction(
        &mut self,
        direction: Direction,
        final_pass: bool,
        upto: Option<usize>,
        env: &DeframeEnv<'_>,
    ) -> Vec<(Direction, Frame)> {
        let FlowInner {
            dirs,
            tls,
            exchange,
            deframe_diagnostics,
            last_activity,
            ..
        } = self;
        let DirectionState {
            stream, deframe, ..
        } = &mut dirs[direction.index()];

        let mut ctx = DeframeContext {
            direction,
            final_pass,
            cancel: env.cancel,
            tls,
            exchange,
            key_log: env.key_log,
            decryptor: env.decryptor,
        };
        let view = match upto {
            Some(segments) => stream.view().prefix(segments),
            None => stream.view(),
        };
        let out = deframe.deframe(view, &mut ctx);

        if let Some(error) = out.error {
            debug!("{} deframing: {}", direction, error);
            deframe_diagnostics.push(Diagnostic::new(*last_activity, Some(direction), error));
        }
        out.frames.into_iter().map(|f| (direction, f)).collect()
    }

    /// Number frames into messages, in completion order
    fn number(
        &mut self,
        flow_id: u64,
        key: FlowKey,
        mut frames: Vec<(Direction, Frame)>,
    ) -> Vec<Arc<ReassembledMessage>> {
        frames.sort_by(|(da, a), (db, b)| {
            a.packet_index
                .cmp(&b.packet_index)
                .then(da.index().cmp(&db.index()))
                .then(a.range.start.cmp(&b.range.start))
        });

        frames
            .into_iter()
            .map(|(direction, frame)| {
                let interval = self
                    .last_message_at
                    .and_then(|prev| (frame.completed_at - prev).to_std().ok())
                    .unwrap_or_default();
                self.last_message_at = Some(frame.completed_at);
                let index = self.next_index;
                self.next_index += 1;

                Arc::new(ReassembledMessage {
                    flow: key,
                    flow_id,
                    direction,
                    index,
                    encoding: DisplayEncoding::derive(&frame.kind, &frame.payload),
                    range: frame.range,
                    payload: frame.payload,
                    kind: frame.kind,
                    timestamp: frame.completed_at,
                    interval,
                })
            })
            .collect()
    }

    fn reset_deframers(&mut self) {
        for dir in &mut self.dirs {
            dir.deframe = DeframeState::new(&self.deframer);
        }
        self.tls = TlsSession::default();
        self.exchange = HttpExchange::default();
        self.deframe_diagnostics.clear();
        self.next_index = 0;
        self.last_message_at = None;
    }
}

/// One bidirectional conversation
#[derive(Debug)]
pub struct Flow {
    id: u64,
    key: FlowKey,
    /// Endpoint whose packets count as outgoing
    reference: FlowEndpoint,
    created_at: DateTime<Utc>,
    process: Option<ProcessInfo>,
    inner: Mutex<FlowInner>,
    messages: RwLock<Arc<Vec<Arc<ReassembledMessage>>>>,
}

impl Flow {
    pub(crate) fn new(
        id: u64,
        key: FlowKey,
        reference: FlowEndpoint,
        created_at: DateTime<Utc>,
        process: Option<ProcessInfo>,
        deframer: DeframerConfig,
        stream_limit: usize,
    ) -> Self {
        let dir = || DirectionState {
            stream: StreamReassembler::new(stream_limit),
            deframe: DeframeState::new(&deframer),
            overflowed: false,
        };
        let dirs = [dir(), dir()];

        Self {
            id,
            key,
            reference,
            created_at,
            process,
            inner: Mutex::new(FlowInner {
                packets: Vec::new(),
                last_activity: created_at,
                status: FlowStatus::Open,
                fin_seen: [false; 2],
                dirs,
                deframer,
                deframer_override: false,
                tls: TlsSession::default(),
                exchange: HttpExchange::default(),
                diagnostics: Vec::new(),
                deframe_diagnostics: Vec::new(),
                next_index: 0,
                last_message_at: None,
            }),
            messages: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn reference(&self) -> FlowEndpoint {
        self.reference
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn process(&self) -> Option<&ProcessInfo> {
        self.process.as_ref()
    }

    /// Direction of a packet relative to the reference endpoint
    pub fn direction_of(&self, packet: &BasicPacket) -> Direction {
        if packet.src_endpoint() == self.reference {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }

    /// Snapshot of the message list; later appends do not affect it
    pub fn messages(&self) -> Arc<Vec<Arc<ReassembledMessage>>> {
        Arc::clone(&self.messages.read())
    }

    pub fn packets(&self) -> Vec<FlowPacket> {
        self.inner.lock().packets.clone()
    }

    pub fn packet_count(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn status(&self) -> FlowStatus {
        self.inner.lock().status
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.lock().last_activity
    }

    pub fn deframer(&self) -> DeframerConfig {
        self.inner.lock().deframer.clone()
    }

    pub fn has_deframer_override(&self) -> bool {
        self.inner.lock().deframer_override
    }

    /// False once encrypted content could not be decrypted
    pub fn is_decryptable(&self) -> bool {
        !self.inner.lock().tls.reported_missing
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let inner = self.inner.lock();
        inner
            .diagnostics
            .iter()
            .chain(inner.deframe_diagnostics.iter())
            .cloned()
            .collect()
    }

    /// Run `f` while holding this flow's state lock
    #[cfg(test)]
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock();
        f()
    }

    /// Copy of the reassembled stream of one direction
    pub fn stream_bytes(&self, direction: Direction) -> Vec<u8> {
        self.inner.lock().dirs[direction.index()].stream.bytes().to_vec()
    }

    pub fn summary(&self) -> FlowSummary {
        let messages = self.messages.read().len();
        let inner = self.inner.lock();
        let mut packets = [0usize; 2];
        for p in &inner.packets {
            packets[p.direction.index()] += 1;
        }
        FlowSummary {
            id: self.id,
            key: self.key,
            reference: self.reference,
            created_at: self.created_at,
            last_activity: inner.last_activity,
            status: inner.status,
            packets,
            bytes: [inner.dirs[0].stream.len(), inner.dirs[1].stream.len()],
            messages,
            deframer: inner.deframer.name(),
            decryptable: !inner.tls.reported_missing,
            process: self.process.clone(),
            diagnostics: inner.diagnostics.len() + inner.deframe_diagnostics.len(),
        }
    }

    /// Record a packet and run it through reassembly and deframing
    pub(crate) fn ingest(&self, packet: Arc<BasicPacket>, env: &DeframeEnv<'_>) -> IngestResult {
        let direction = self.direction_of(&packet);
        let mut result = IngestResult::new(direction);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let packet_index = inner.packets.len();
        inner.packets.push(FlowPacket {
            direction,
            packet: Arc::clone(&packet),
        });
        inner.last_activity = inner.last_activity.max(packet.timestamp);

        if inner.status == FlowStatus::Closed {
            trace!("Flow {} closed, recording packet {} only", self.id, packet_index);
            result.after_close = true;
            return result;
        }

        if let Err(error) = packet.check() {
            debug!("Flow {}: {}", self.id, error);
            let diag = Diagnostic::new(packet.timestamp, Some(direction), error);
            inner.diagnostics.push(diag.clone());
            result.malformed = true;
            result.diagnostics.push(diag);
            return result;
        }

        let dir = &mut inner.dirs[direction.index()];
        if !packet.payload.is_empty() && !dir.overflowed {
            match dir.stream.feed(&packet.payload, packet.timestamp, packet_index) {
                Ok(()) => result.delivered = true,
                Err(error) => {
                    dir.overflowed = true;
                    let diag = Diagnostic::new(packet.timestamp, Some(direction), error);
                    inner.diagnostics.push(diag.clone());
                    result.diagnostics.push(diag);
                }
            }
        }

        let previous = inner.status;
        // Rst closes even when Fin wins the role classification
        let rst = packet.tcp_headers().is_some_and(|h| h.flags.rst);
        match packet.role() {
            _ if rst => inner.status = FlowStatus::Closed,
            Some(role) if role.is_fin() => {
                inner.fin_seen[direction.index()] = true;
                inner.status = if inner.fin_seen.iter().all(|f| *f) {
                    FlowStatus::Closed
                } else {
                    FlowStatus::HalfClosed
                };
            }
            _ => {}
        }
        if inner.status != previous {
            debug!("Flow {} {} -> {}", self.key, previous, inner.status);
            result.status_change = Some(inner.status);
        }

        let before = inner.deframe_diagnostics.len();
        let frames = if inner.status == FlowStatus::Closed {
            // Final flush of both directions
            let mut frames = inner.deframe_direction(Direction::Outgoing, true, None, env);
            frames.extend(inner.deframe_direction(Direction::Incoming, true, None, env));
            frames
        } else if result.delivered {
            inner.deframe_direction(direction, false, None, env)
        } else {
            Vec::new()
        };
        result
            .diagnostics
            .extend(inner.deframe_diagnostics[before..].iter().cloned());

        let messages = inner.number(self.id, self.key, frames);
        if !messages.is_empty() {
            let mut list = self.messages.write();
            Arc::make_mut(&mut list).extend(messages.iter().cloned());
        }
        result.messages = messages;
        result
    }

    /// Rebuild all messages from offset 0, optionally under a new deframer.
    /// Returns the complete new message list.
    pub(crate) fn rederive(
        &self,
        deframer: Option<(DeframerConfig, bool)>,
        env: &DeframeEnv<'_>,
    ) -> (Vec<Arc<ReassembledMessage>>, Vec<Diagnostic>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some((config, is_override)) = deframer {
            inner.deframer = config;
            inner.deframer_override = is_override;
        }
        inner.reset_deframers();

        // Replay segments in capture order, as ingestion saw them
        let mut order: Vec<(usize, Direction, usize)> = Direction::BOTH
            .iter()
            .flat_map(|&direction| {
                inner.dirs[direction.index()]
                    .stream
                    .segments()
                    .iter()
                    .enumerate()
                    .map(move |(i, seg)| (seg.packet_index, direction, i + 1))
            })
            .collect();
        order.sort_unstable();

        let mut frames = Vec::new();
        for (_, direction, upto) in order {
            if env.cancel.is_cancelled() {
                break;
            }
            frames.extend(inner.deframe_direction(direction, false, Some(upto), env));
        }
        if inner.status == FlowStatus::Closed {
            frames.extend(inner.deframe_direction(Direction::Outgoing, true, None, env));
            frames.extend(inner.deframe_direction(Direction::Incoming, true, None, env));
        }
        let messages = inner.number(self.id, self.key, frames);

        *self.messages.write() = Arc::new(messages.clone());
        debug!(
            "Flow {} re-derived with {}: {} messages",
            self.key,
            inner.deframer.name(),
            messages.len()
        );
        (messages, inner.deframe_diagnostics.clone())
    }

    /// Record a problem that is not tied to a packet
    pub(crate) fn push_diagnostic(&self, error: FlowError) -> Diagnostic {
        let mut inner = self.inner.lock();
        let diag = Diagnostic::new(inner.last_activity, None, error);
        inner.diagnostics.push(diag.clone());
        diag
    }
}
