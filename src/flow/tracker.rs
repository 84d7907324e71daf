//! Flow manager - ingestion and change notification
//!
//! Routes packets to flows, owns the active deframing configuration and
//! fans out [`FlowEvent`]s to subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::state::{DeframeEnv, Flow, FlowStatus};
use super::table::FlowStore;
use super::{CancelToken, Diagnostic, FlowKey, TrackerStats};
use crate::deframe::{DeframerConfig, KeyLog, KeyLogProvider, TlsRecordDecryptor};
use crate::error::{FlowError, Result};
use crate::message::ReassembledMessage;
use crate::process::{NoProcessResolver, ProcessResolver};
use crate::types::{BasicPacket, Direction};

/// Change notification for subscribers
#[derive(Debug, Clone)]
pub enum FlowEvent {
    FlowOpened {
        key: FlowKey,
        id: u64,
    },
    MessageAppended {
        key: FlowKey,
        message: Arc<ReassembledMessage>,
    },
    /// Message list rebuilt from scratch; replaces everything seen before
    MessagesReset {
        key: FlowKey,
        messages: Arc<Vec<Arc<ReassembledMessage>>>,
    },
    StatusChanged {
        key: FlowKey,
        status: FlowStatus,
    },
    Diagnostic {
        key: Option<FlowKey>,
        diagnostic: Diagnostic,
    },
    FlowEvicted {
        key: FlowKey,
    },
    /// Store was cleared
    Cleared,
}

impl FlowEvent {
    pub fn key(&self) -> Option<FlowKey> {
        match self {
            FlowEvent::FlowOpened { key, .. }
            | FlowEvent::MessageAppended { key, .. }
            | FlowEvent::MessagesReset { key, .. }
            | FlowEvent::StatusChanged { key, .. }
            | FlowEvent::FlowEvicted { key } => Some(*key),
            FlowEvent::Diagnostic { key, .. } => *key,
            FlowEvent::Cleared => None,
        }
    }
}

/// What happened to one ingested packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Payload reached the deframer
    Delivered {
        key: FlowKey,
        direction: Direction,
        messages: usize,
    },
    /// Recorded on the flow; nothing to deframe
    Recorded { key: FlowKey, direction: Direction },
    /// Flow already closed; recorded only
    AfterClose { key: FlowKey },
    /// Recorded with a diagnostic; not deframed
    Malformed { key: FlowKey },
    /// Not attributable to any flow
    Dropped(FlowError),
    /// Filtered out by protocol or target port
    Ignored,
}

struct Subscriber {
    filter: Option<FlowKey>,
    tx: Sender<FlowEvent>,
}

impl Subscriber {
    fn accepts(&self, event: &FlowEvent) -> bool {
        match (self.filter, event) {
            (None, _) | (_, FlowEvent::Cleared) => true,
            (Some(filter), event) => event.key() == Some(filter),
        }
    }
}

/// Packet ingestion front end over a [`FlowStore`]
pub struct FlowManager {
    store: FlowStore,
    deframer: RwLock<DeframerConfig>,
    target_port: RwLock<Option<u16>>,
    key_log: RwLock<Option<Arc<dyn KeyLogProvider>>>,
    decryptor: RwLock<Option<Arc<dyn TlsRecordDecryptor>>>,
    resolver: RwLock<Arc<dyn ProcessResolver>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Bumped on clear/stop; trips outstanding cancel tokens
    session: Arc<AtomicU64>,
    stats: Mutex<TrackerStats>,
}

impl FlowManager {
    pub fn new(store: FlowStore) -> Self {
        info!(
            "Initializing flow manager (max_flows={}, stream_limit={})",
            store.config().max_flows,
            store.config().stream_limit()
        );
        Self {
            store,
            deframer: RwLock::new(DeframerConfig::default()),
            target_port: RwLock::new(None),
            key_log: RwLock::new(None),
            decryptor: RwLock::new(None),
            resolver: RwLock::new(Arc::new(NoProcessResolver)),
            subscribers: Mutex::new(Vec::new()),
            session: Arc::new(AtomicU64::new(0)),
            stats: Mutex::new(TrackerStats::default()),
        }
    }

    pub fn with_process_resolver(self, resolver: Arc<dyn ProcessResolver>) -> Self {
        *self.resolver.write() = resolver;
        self
    }

    pub fn with_decryptor(self, decryptor: Arc<dyn TlsRecordDecryptor>) -> Self {
        *self.decryptor.write() = Some(decryptor);
        self
    }

    pub fn with_key_log(self, key_log: Arc<dyn KeyLogProvider>) -> Self {
        *self.key_log.write() = Some(key_log);
        self
    }

    pub fn with_target_port(self, port: Option<u16>) -> Self {
        *self.target_port.write() = port;
        self
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// Token that trips on the next clear or stop
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(&self.session))
    }

    /// Route one packet to its flow. Never fails; problems are recorded as
    /// diagnostics and reported in the outcome.
    pub fn ingest(&self, packet: BasicPacket) -> IngestOutcome {
        self.stats.lock().packets_processed += 1;

        if !packet.is_tcp() {
            trace!("Ignoring non-TCP packet {:?}", packet.protocol);
            self.stats.lock().packets_ignored += 1;
            return IngestOutcome::Ignored;
        }
        if let Some(port) = *self.target_port.read() {
            if !packet.touches_port(port) {
                self.stats.lock().packets_ignored += 1;
                return IngestOutcome::Ignored;
            }
        }

        let cancel = self.cancel_token();
        let deframer = self.deframer.read().clone();
        let resolver = Arc::clone(&*self.resolver.read());

        let resolved = match self.store.resolve(&packet, &deframer, resolver.as_ref()) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!("Dropping packet: {}", error);
                let diagnostic = Diagnostic::new(packet.timestamp, None, error.clone());
                self.store.record_diagnostic(diagnostic.clone());
                self.stats.lock().packets_dropped += 1;
                self.publish(FlowEvent::Diagnostic {
                    key: None,
                    diagnostic,
                });
                return IngestOutcome::Dropped(error);
            }
        };

        let flow = resolved.flow;
        let key = flow.key();
        if let Some(evicted) = resolved.evicted {
            self.stats.lock().flows_evicted += 1;
            self.publish(FlowEvent::FlowEvicted { key: evicted });
        }
        if resolved.created {
            self.stats.lock().flows_created += 1;
            self.publish(FlowEvent::FlowOpened { key, id: flow.id() });
        }

        let key_log = self.key_log.read().clone();
        let decryptor = self.decryptor.read().clone();
        let env = DeframeEnv {
            key_log: key_log.as_ref(),
            decryptor: decryptor.as_ref(),
            cancel: &cancel,
        };
        let payload_len = packet.payload.len() as u64;
        let result = flow.ingest(Arc::new(packet), &env);

        // After stop() the flow and its new messages remain; only a clear drops them
        let registered = self.store.get(&key).is_some_and(|f| Arc::ptr_eq(&f, &flow));
        if cancel.is_cancelled() && !registered {
            debug!("Flow {} cleared during ingest, discarding events", key);
            return IngestOutcome::Recorded {
                key,
                direction: result.direction,
            };
        }

        {
            let mut stats = self.stats.lock();
            if result.malformed {
                stats.packets_malformed += 1;
            } else {
                stats.bytes_processed += payload_len;
            }
            stats.messages_emitted += result.messages.len() as u64;
        }

        if let Some(status) = result.status_change {
            self.publish(FlowEvent::StatusChanged { key, status });
        }
        for diagnostic in result.diagnostics {
            self.publish(FlowEvent::Diagnostic {
                key: Some(key),
                diagnostic,
            });
        }
        let messages = result.messages.len();
        for message in result.messages {
            self.publish(FlowEvent::MessageAppended { key, message });
        }

        if result.after_close {
            IngestOutcome::AfterClose { key }
        } else if result.malformed {
            IngestOutcome::Malformed { key }
        } else if result.delivered {
            IngestOutcome::Delivered {
                key,
                direction: result.direction,
                messages,
            }
        } else {
            IngestOutcome::Recorded {
                key,
                direction: result.direction,
            }
        }
    }

    /// Receive events for every flow, or only for `filter`
    pub fn subscribe(&self, filter: Option<FlowKey>) -> Receiver<FlowEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(Subscriber { filter, tx });
        rx
    }

    fn publish(&self, event: FlowEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.accepts(&event) || s.tx.send(event.clone()).is_ok());
    }

    pub fn deframer(&self) -> DeframerConfig {
        self.deframer.read().clone()
    }

    /// Switch the deframer of every flow without its own override and
    /// re-derive their messages from the start of the streams
    pub fn set_deframer(&self, config: DeframerConfig) -> Result<()> {
        config.validate()?;
        self.load_key_log_for(&config)?;
        info!("Deframer set to {}", config.name());
        *self.deframer.write() = config.clone();

        for flow in self.store.flows() {
            if !flow.has_deframer_override() {
                self.rederive(&flow, Some((config.clone(), false)));
            }
        }
        Ok(())
    }

    /// Switch the deframer of one flow only
    pub fn set_flow_deframer(&self, key: &FlowKey, config: DeframerConfig) -> Result<()> {
        config.validate()?;
        let flow = self.flow_or_err(key)?;
        self.load_key_log_for(&config)?;
        debug!("Flow {} deframer set to {}", key, config.name());
        self.rederive(&flow, Some((config, true)));
        Ok(())
    }

    /// Drop a per-flow override and return to the global deframer
    pub fn clear_flow_deframer(&self, key: &FlowKey) -> Result<()> {
        let flow = self.flow_or_err(key)?;
        let global = self.deframer();
        self.rederive(&flow, Some((global, false)));
        Ok(())
    }

    /// Replace the key material used for TLS flows and re-derive them
    pub fn set_key_log(&self, key_log: Option<Arc<dyn KeyLogProvider>>) {
        *self.key_log.write() = key_log;
        self.rederive_tls_flows();
    }

    pub fn load_key_log(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let log = KeyLog::from_file(path)?;
        info!("Key log {}: {} sessions", path.display(), log.len());
        self.set_key_log(Some(Arc::new(log)));
        Ok(())
    }

    pub fn set_decryptor(&self, decryptor: Option<Arc<dyn TlsRecordDecryptor>>) {
        *self.decryptor.write() = decryptor;
        self.rederive_tls_flows();
    }

    pub fn set_process_resolver(&self, resolver: Arc<dyn ProcessResolver>) {
        *self.resolver.write() = resolver;
    }

    pub fn target_port(&self) -> Option<u16> {
        *self.target_port.read()
    }

    /// Restrict capture to one port; changing it starts a fresh session
    pub fn set_target_port(&self, port: Option<u16>) {
        {
            let mut current = self.target_port.write();
            if *current == port {
                return;
            }
            *current = port;
        }
        info!("Target port set to {:?}", port);
        self.clear();
    }

    /// Drop all flows and cancel in-flight deframing
    pub fn clear(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        self.store.clear();
        self.stats.lock().active_flows = 0;
        self.publish(FlowEvent::Cleared);
    }

    /// Cancel in-flight deframing and end the current capture session.
    /// Flows are kept.
    pub fn stop(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        info!("Capture session stopped");
    }

    /// Remove flows idle since `cutoff`
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let evicted = self.store.evict_idle(cutoff);
        self.stats.lock().flows_evicted += evicted.len() as u64;
        for key in &evicted {
            self.publish(FlowEvent::FlowEvicted { key: *key });
        }
        evicted.len()
    }

    pub fn list_flows(&self) -> Vec<FlowKey> {
        self.store.list_flows()
    }

    pub fn flow(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.store.get(key)
    }

    pub fn flows(&self) -> Vec<Arc<Flow>> {
        self.store.flows()
    }

    /// Snapshot of a flow's messages
    pub fn messages(&self, key: &FlowKey) -> Option<Arc<Vec<Arc<ReassembledMessage>>>> {
        self.store.get(key).map(|f| f.messages())
    }

    /// Diagnostics not attributable to a flow
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.store.diagnostics()
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = self.stats.lock().clone();
        stats.active_flows = self.store.len();
        stats
    }

    fn flow_or_err(&self, key: &FlowKey) -> Result<Arc<Flow>> {
        self.store
            .get(key)
            .ok_or_else(|| FlowError::UnknownFlow(key.to_string()))
    }

    fn load_key_log_for(&self, config: &DeframerConfig) -> Result<()> {
        if let DeframerConfig::HttpsWithKeyLog {
            key_log_path: Some(path),
        } = config
        {
            let log = KeyLog::from_file(path).map_err(|e| FlowError::Config(format!("{:#}", e)))?;
            *self.key_log.write() = Some(Arc::new(log));
        }
        Ok(())
    }

    fn rederive_tls_flows(&self) {
        for flow in self.store.flows() {
            if flow.deframer().uses_key_log() {
                self.rederive(&flow, None);
            }
        }
    }

    fn rederive(&self, flow: &Flow, deframer: Option<(DeframerConfig, bool)>) {
        let cancel = self.cancel_token();
        let key_log = self.key_log.read().clone();
        let decryptor = self.decryptor.read().clone();
        let env = DeframeEnv {
            key_log: key_log.as_ref(),
            decryptor: decryptor.as_ref(),
            cancel: &cancel,
        };
        let (messages, diagnostics) = flow.rederive(deframer, &env);
        if cancel.is_cancelled() {
            return;
        }

        self.stats.lock().rederivations += 1;
        let key = flow.key();
        self.publish(FlowEvent::MessagesReset {
            key,
            messages: Arc::new(messages),
        });
        for diagnostic in diagnostics {
            self.publish(FlowEvent::Diagnostic {
                key: Some(key),
                diagnostic,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deframe::{LengthPrefixConfig, SessionSecrets, TlsRecord};
    use crate::flow::{FlowConfig, FlowEndpoint};
    use crate::message::MessageKind;
    use crate::types::{TcpFlags, TransportHeaders, TransportProtocol};
    use chrono::TimeZone;
    use std::net::SocketAddr;
    use std::thread;
    use std::time::Duration;

    const CLIENT: &str = "192.168.1.100:54321";
    const SERVER: &str = "10.0.0.1:80";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pkt(from: &str, to: &str, bits: u8, payload: &[u8], secs: i64) -> BasicPacket {
        BasicPacket::tcp(addr(from), addr(to), TcpFlags::from_u8(bits), payload).with_timestamp(ts(secs))
    }

    fn data(from: &str, to: &str, payload: &[u8], secs: i64) -> BasicPacket {
        pkt(from, to, 0x18, payload, secs)
    }

    fn manager() -> FlowManager {
        FlowManager::new(FlowStore::new(FlowConfig::default()))
    }

    fn drain(rx: &Receiver<FlowEvent>) -> Vec<FlowEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_handshake_and_data() {
        let m = manager();
        m.ingest(pkt(CLIENT, SERVER, 0x02, b"", 1));
        m.ingest(pkt(SERVER, CLIENT, 0x12, b"", 2));
        m.ingest(pkt(CLIENT, SERVER, 0x10, b"", 3));
        let outcome = m.ingest(data(CLIENT, SERVER, b"hello", 4));

        let key = m.list_flows()[0];
        assert_eq!(
            outcome,
            IngestOutcome::Delivered {
                key,
                direction: Direction::Outgoing,
                messages: 1
            }
        );
        let flow = m.flow(&key).unwrap();
        assert_eq!(flow.packet_count(), 4);
        assert_eq!(flow.reference(), FlowEndpoint::from(addr(CLIENT)));

        let stats = m.stats();
        assert_eq!(stats.packets_processed, 4);
        assert_eq!(stats.flows_created, 1);
        assert_eq!(stats.active_flows, 1);
        assert_eq!(stats.bytes_processed, 5);
    }

    #[test]
    fn test_syn_ack_first_orients_flow_at_receiver() {
        let m = manager();
        m.ingest(pkt(SERVER, CLIENT, 0x12, b"", 1));
        let outcome = m.ingest(data(CLIENT, SERVER, b"x", 2));
        assert!(matches!(
            outcome,
            IngestOutcome::Delivered {
                direction: Direction::Outgoing,
                ..
            }
        ));
    }

    #[test]
    fn test_switching_deframer_rederives_without_duplicates() {
        let m = manager();
        m.ingest(data(CLIENT, SERVER, b"GET / HTTP/1.1\r\n", 1));
        m.ingest(data(CLIENT, SERVER, b"Host: a\r\n\r\n", 2));
        m.ingest(data(SERVER, CLIENT, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc", 3));
        let key = m.list_flows()[0];
        assert_eq!(m.messages(&key).unwrap().len(), 3);

        let rx = m.subscribe(Some(key));
        m.set_deframer(DeframerConfig::Http).unwrap();
        let messages = m.messages(&key).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::HttpRequest);
        assert_eq!(messages[1].kind, MessageKind::HttpResponse);
        assert_eq!(messages[1].index, 1);

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FlowEvent::MessagesReset { messages, .. } if messages.len() == 2));

        // Switching again and back yields the same list
        m.set_deframer(DeframerConfig::Raw).unwrap();
        m.set_deframer(DeframerConfig::Http).unwrap();
        assert_eq!(m.messages(&key).unwrap().len(), 2);
        assert_eq!(m.stats().rederivations, 3);
    }

    #[test]
    fn test_after_close_packets_recorded_only() {
        let m = manager();
        m.ingest(data(CLIENT, SERVER, b"one", 1));
        m.ingest(pkt(CLIENT, SERVER, 0x04, b"", 2));
        let key = m.list_flows()[0];
        let rx = m.subscribe(None);

        let outcome = m.ingest(data(SERVER, CLIENT, b"late", 3));
        assert_eq!(outcome, IngestOutcome::AfterClose { key });
        assert!(drain(&rx).is_empty());
        assert_eq!(m.messages(&key).unwrap().len(), 1);
        assert_eq!(m.flow(&key).unwrap().packet_count(), 3);
        assert_eq!(m.flow(&key).unwrap().status(), FlowStatus::Closed);
    }

    #[test]
    fn test_malformed_packet_gets_diagnostic() {
        let m = manager();
        let rx = m.subscribe(None);
        let mut bad = data(CLIENT, SERVER, b"payload", 1);
        if let TransportHeaders::Tcp(tcp) = &mut bad.headers {
            tcp.total_length = 10;
        }
        let outcome = m.ingest(bad);
        let key = m.list_flows()[0];
        assert_eq!(outcome, IngestOutcome::Malformed { key });
        assert!(m.messages(&key).unwrap().is_empty());

        let events = drain(&rx);
        assert!(events.iter().any(|e| matches!(
            e,
            FlowEvent::Diagnostic { diagnostic, .. }
                if matches!(diagnostic.error, FlowError::MalformedPacket(_))
        )));
        assert_eq!(m.stats().packets_malformed, 1);

        // Flow keeps working
        let outcome = m.ingest(data(CLIENT, SERVER, b"ok", 2));
        assert!(matches!(outcome, IngestOutcome::Delivered { messages: 1, .. }));
    }

    #[test]
    fn test_identical_endpoints_dropped() {
        let m = manager();
        let outcome = m.ingest(data("10.0.0.5:9000", "10.0.0.5:9000", b"loop", 1));
        assert!(matches!(outcome, IngestOutcome::Dropped(FlowError::InvalidFlowKey(_))));
        assert!(m.list_flows().is_empty());
        assert_eq!(m.diagnostics().len(), 1);
        assert_eq!(m.stats().packets_dropped, 1);
    }

    #[test]
    fn test_flows_are_isolated() {
        let m = manager();
        m.set_deframer(DeframerConfig::LengthPrefixed(LengthPrefixConfig::default()))
            .unwrap();
        let other = "192.168.1.100:54322";

        m.ingest(data(CLIENT, SERVER, &[0x03, 0x00, b'A'], 1));
        m.ingest(data(other, SERVER, &[0x02, 0x00, b'X', b'Y'], 2));
        m.ingest(data(CLIENT, SERVER, &[b'B', b'C'], 3));

        let flows = m.list_flows();
        assert_eq!(flows.len(), 2);
        let first = m.messages(&flows[0]).unwrap();
        let second = m.messages(&flows[1]).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, b"ABC");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, b"XY");
    }

    #[test]
    fn test_non_tcp_ignored() {
        let m = manager();
        let mut p = data(CLIENT, SERVER, b"dns", 1);
        p.protocol = TransportProtocol::Udp;
        p.headers = TransportHeaders::Udp { length: 11 };
        assert_eq!(m.ingest(p), IngestOutcome::Ignored);
        assert!(m.list_flows().is_empty());
    }

    #[test]
    fn test_target_port_filters_and_clears() {
        let m = manager();
        m.ingest(data(CLIENT, "10.0.0.1:443", b"a", 1));
        assert_eq!(m.list_flows().len(), 1);

        let rx = m.subscribe(None);
        m.set_target_port(Some(80));
        assert!(m.list_flows().is_empty());
        assert!(matches!(drain(&rx).as_slice(), [FlowEvent::Cleared]));

        assert_eq!(m.ingest(data(CLIENT, "10.0.0.1:443", b"a", 2)), IngestOutcome::Ignored);
        assert!(matches!(m.ingest(data(CLIENT, SERVER, b"b", 3)), IngestOutcome::Delivered { .. }));

        // Same port again is a no-op
        m.set_target_port(Some(80));
        assert_eq!(m.list_flows().len(), 1);
    }

    #[test]
    fn test_subscription_filter() {
        let m = manager();
        m.ingest(data(CLIENT, SERVER, b"a", 1));
        let key = m.list_flows()[0];
        let rx = m.subscribe(Some(key));

        m.ingest(data("192.168.1.100:1111", SERVER, b"other", 2));
        m.ingest(data(SERVER, CLIENT, b"b", 3));

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FlowEvent::MessageAppended { message, .. } => {
                assert_eq!(message.payload, b"b");
                assert_eq!(message.direction, Direction::Incoming);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clear_cancels_outstanding_tokens() {
        let m = manager();
        let token = m.cancel_token();
        m.ingest(data(CLIENT, SERVER, b"a", 1));
        m.clear();
        assert!(token.is_cancelled());
        assert!(m.list_flows().is_empty());
        assert!(!m.cancel_token().is_cancelled());

        let token = m.cancel_token();
        m.stop();
        assert!(token.is_cancelled());
    }

    /// Key log that ends the capture session when consulted
    struct StopOnLookup(Arc<AtomicU64>);

    impl KeyLogProvider for StopOnLookup {
        fn lookup(&self, _client_random: &[u8; 32]) -> Option<SessionSecrets> {
            self.0.fetch_add(1, Ordering::AcqRel);
            None
        }
    }

    #[test]
    fn test_stop_during_ingest_still_publishes() {
        let m = manager();
        m.set_deframer(DeframerConfig::HttpsWithKeyLog { key_log_path: None })
            .unwrap();
        m.set_key_log(Some(Arc::new(StopOnLookup(Arc::clone(&m.session)))));
        m.ingest(data(CLIENT, SERVER, &client_hello([9u8; 32]), 1));
        let key = m.list_flows()[0];

        let rx = m.subscribe(None);
        m.ingest(data(CLIENT, SERVER, &tls_record(23, b"secret"), 2));
        assert_eq!(m.messages(&key).unwrap().len(), 1);

        let events = drain(&rx);
        assert!(events.iter().any(|e| matches!(
            e,
            FlowEvent::MessageAppended { message, .. }
                if matches!(message.kind, MessageKind::Error { .. })
        )));
        assert_eq!(m.stats().messages_emitted, 1);
    }

    #[test]
    fn test_snapshots_are_never_torn() {
        let m = Arc::new(manager());
        m.ingest(data(CLIENT, SERVER, b"m0", 0));
        let key = m.list_flows()[0];

        let writer = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for i in 1..500i64 {
                    m.ingest(data(CLIENT, SERVER, format!("m{}", i).as_bytes(), i));
                }
            })
        };

        let mut seen = 0;
        while seen < 500 {
            let snapshot = m.messages(&key).unwrap();
            assert!(snapshot.len() >= seen);
            for (i, message) in snapshot.iter().enumerate() {
                assert_eq!(message.index, i as u64);
                assert_eq!(message.payload, format!("m{}", i).as_bytes());
            }
            seen = snapshot.len();
            if writer.is_finished() && seen < 500 {
                seen = m.messages(&key).unwrap().len();
                assert_eq!(seen, 500);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_locked_flow_does_not_block_others() {
        let m = Arc::new(manager());
        m.ingest(data(CLIENT, SERVER, b"a", 1));
        let busy = m.flow(&m.list_flows()[0]).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        busy.with_locked(|| {
            let m = Arc::clone(&m);
            let worker = thread::spawn(move || {
                let outcome = m.ingest(data("192.168.1.100:1111", SERVER, b"b", 2));
                tx.send(outcome).unwrap();
            });
            let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(outcome, IngestOutcome::Delivered { messages: 1, .. }));
            worker.join().unwrap();
        });
        assert_eq!(m.list_flows().len(), 2);
    }

    #[test]
    fn test_per_flow_override_survives_global_switch() {
        let m = manager();
        m.ingest(data(CLIENT, SERVER, b"GET / HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n", 1));
        m.ingest(data("192.168.1.100:1111", SERVER, b"GET / HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n", 2));
        let flows = m.list_flows();

        m.set_flow_deframer(&flows[0], DeframerConfig::Http).unwrap();
        m.set_deframer(DeframerConfig::Raw).unwrap();
        assert_eq!(m.messages(&flows[0]).unwrap().len(), 2);
        assert_eq!(m.messages(&flows[1]).unwrap().len(), 1);

        m.clear_flow_deframer(&flows[0]).unwrap();
        assert_eq!(m.messages(&flows[0]).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_deframer_config_rejected() {
        let m = manager();
        let bad = LengthPrefixConfig {
            length_width: 0,
            ..Default::default()
        };
        let err = m.set_deframer(DeframerConfig::LengthPrefixed(bad)).unwrap_err();
        assert!(matches!(err, FlowError::Framing(_)));
        assert_eq!(m.deframer(), DeframerConfig::Raw);
    }

    fn tls_record(ct: u8, body: &[u8]) -> Vec<u8> {
        let mut r = vec![ct, 0x03, 0x03];
        r.extend_from_slice(&(body.len() as u16).to_be_bytes());
        r.extend_from_slice(body);
        r
    }

    fn client_hello(random: [u8; 32]) -> Vec<u8> {
        let mut body = vec![1, 0x00, 0x00, 0x26, 0x03, 0x03];
        body.extend_from_slice(&random);
        tls_record(22, &body)
    }

    struct Passthrough;

    impl TlsRecordDecryptor for Passthrough {
        fn decrypt(&self, _secrets: &SessionSecrets, record: &TlsRecord<'_>) -> std::result::Result<Vec<u8>, String> {
            Ok(record.fragment.to_vec())
        }
    }

    #[test]
    fn test_https_without_key_then_with_key() {
        let m = manager();
        m.set_deframer(DeframerConfig::HttpsWithKeyLog { key_log_path: None })
            .unwrap();
        let random = [7u8; 32];
        m.ingest(data(CLIENT, SERVER, &client_hello(random), 1));
        m.ingest(data(CLIENT, SERVER, &tls_record(23, b"GET / HTTP/1.1\r\n\r\n"), 2));

        let key = m.list_flows()[0];
        let flow = m.flow(&key).unwrap();
        assert!(!flow.is_decryptable());
        let messages = m.messages(&key).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0].kind {
            MessageKind::Error { expected_key, .. } => {
                assert_eq!(expected_key.as_deref(), Some(hex::encode(random).as_str()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(flow
            .diagnostics()
            .iter()
            .any(|d| matches!(d.error, FlowError::DecryptionUnavailable { .. })));

        let log = KeyLog::parse(&format!(
            "CLIENT_TRAFFIC_SECRET_0 {} {}\n",
            hex::encode(random),
            "22".repeat(32)
        ));
        m.set_decryptor(Some(Arc::new(Passthrough)));
        m.set_key_log(Some(Arc::new(log)));

        let messages = m.messages(&key).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::HttpRequest);
        assert!(flow.is_decryptable());
    }
}
