//! Flow store
//!
//! Concurrent map from canonical key to flow. Lookups from the presentation
//! side never block packet ingestion on other flows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::state::Flow;
use super::{Diagnostic, FlowConfig, FlowEndpoint, FlowKey, TcpRole};
use crate::deframe::DeframerConfig;
use crate::error::Result;
use crate::process::ProcessResolver;
use crate::types::BasicPacket;

/// Flow lookup result
pub struct Resolved {
    pub flow: Arc<Flow>,
    pub created: bool,
    /// Flow evicted to make room, if the store was full
    pub evicted: Option<FlowKey>,
}

/// Store of all flows of the current capture session
pub struct FlowStore {
    flows: DashMap<FlowKey, Arc<Flow>>,
    config: FlowConfig,
    next_id: AtomicU64,
    /// Problems not attributable to any flow
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl FlowStore {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            flows: DashMap::with_capacity(config.max_flows.min(100_000)),
            config,
            next_id: AtomicU64::new(1),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Endpoint a new flow is oriented around: the sender of the first
    /// packet, or its receiver when the first packet is a SYN-ACK
    pub fn reference_endpoint(packet: &BasicPacket) -> FlowEndpoint {
        match packet.role() {
            Some(TcpRole::SynAck) => packet.dst_endpoint(),
            _ => packet.src_endpoint(),
        }
    }

    /// Find the flow a packet belongs to, creating it on first sight
    pub fn resolve(
        &self,
        packet: &BasicPacket,
        deframer: &DeframerConfig,
        resolver: &dyn ProcessResolver,
    ) -> Result<Resolved> {
        let key = FlowKey::new(packet.src_endpoint(), packet.dst_endpoint())?;

        if let Some(flow) = self.flows.get(&key).map(|f| Arc::clone(f.value())) {
            return Ok(Resolved {
                flow,
                created: false,
                evicted: None,
            });
        }

        let evicted = if self.flows.len() >= self.config.max_flows {
            self.evict_oldest()
        } else {
            None
        };

        let reference = Self::reference_endpoint(packet);
        let process = resolver.resolve(&reference);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flow = Arc::new(Flow::new(
            id,
            key,
            reference,
            packet.timestamp,
            process,
            deframer.clone(),
            self.config.stream_limit(),
        ));
        trace!("New flow {} ({}), reference {}", id, key, reference);

        let flow = Arc::clone(self.flows.entry(key).or_insert(flow).value());
        Ok(Resolved {
            created: flow.id() == id,
            flow,
            evicted,
        })
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.get(key).map(|f| Arc::clone(f.value()))
    }

    /// All flows, in first-seen order
    pub fn flows(&self) -> Vec<Arc<Flow>> {
        let mut flows: Vec<_> = self.flows.iter().map(|f| Arc::clone(f.value())).collect();
        flows.sort_by_key(|f| f.id());
        flows
    }

    /// Keys of all flows, in first-seen order
    pub fn list_flows(&self) -> Vec<FlowKey> {
        self.flows().iter().map(|f| f.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.remove(key).map(|(_, f)| f)
    }

    /// Drop every flow and store diagnostic
    pub fn clear(&self) {
        let count = self.flows.len();
        self.flows.clear();
        self.diagnostics.lock().clear();
        debug!("Cleared {} flows", count);
    }

    /// Remove flows with no activity since `cutoff`
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> Vec<FlowKey> {
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|f| f.value().last_activity() < cutoff)
            .map(|f| *f.key())
            .collect();
        for key in &idle {
            self.flows.remove(key);
        }
        if !idle.is_empty() {
            debug!("Evicted {} idle flows", idle.len());
        }
        idle
    }

    fn evict_oldest(&self) -> Option<FlowKey> {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|f| f.value().last_activity())
            .map(|f| *f.key())?;
        self.flows.remove(&oldest);
        debug!("Flow store full, evicted {}", oldest);
        Some(oldest)
    }

    pub fn record_diagnostic(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::process::NoProcessResolver;
    use crate::types::TcpFlags;
    use chrono::TimeZone;
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pkt(from: &str, to: &str, bits: u8, secs: i64) -> BasicPacket {
        BasicPacket::tcp(addr(from), addr(to), TcpFlags::from_u8(bits), b"")
            .with_timestamp(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn resolve(store: &FlowStore, p: &BasicPacket) -> Result<Resolved> {
        store.resolve(p, &DeframerConfig::Raw, &NoProcessResolver)
    }

    #[test]
    fn test_both_directions_share_a_flow() {
        let store = FlowStore::new(FlowConfig::default());
        let a = resolve(&store, &pkt("10.0.0.1:1000", "10.0.0.2:80", 0x02, 1)).unwrap();
        let b = resolve(&store, &pkt("10.0.0.2:80", "10.0.0.1:1000", 0x12, 2)).unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert!(Arc::ptr_eq(&a.flow, &b.flow));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reference_endpoint() {
        let syn_ack = pkt("10.0.0.2:80", "10.0.0.1:1000", 0x12, 1);
        assert_eq!(
            FlowStore::reference_endpoint(&syn_ack),
            FlowEndpoint::from(addr("10.0.0.1:1000"))
        );
        let data = pkt("10.0.0.2:80", "10.0.0.1:1000", 0x18, 1);
        assert_eq!(
            FlowStore::reference_endpoint(&data),
            FlowEndpoint::from(addr("10.0.0.2:80"))
        );
    }

    #[test]
    fn test_identical_endpoints_rejected() {
        let store = FlowStore::new(FlowConfig::default());
        let err = resolve(&store, &pkt("10.0.0.1:53", "10.0.0.1:53", 0x02, 1)).err();
        assert!(matches!(err, Some(FlowError::InvalidFlowKey(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_flows_in_first_seen_order() {
        let store = FlowStore::new(FlowConfig::default());
        for port in [3000u16, 1000, 2000] {
            let p = pkt(&format!("10.0.0.1:{}", port), "10.0.0.2:80", 0x02, 1);
            resolve(&store, &p).unwrap();
        }
        let ports: Vec<u16> = store.list_flows().iter().map(|k| k.low().port.max(k.high().port)).collect();
        assert_eq!(ports, vec![3000, 1000, 2000]);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let config = FlowConfig {
            max_flows: 2,
            ..Default::default()
        };
        let store = FlowStore::new(config);
        resolve(&store, &pkt("10.0.0.1:1", "10.0.0.2:80", 0x02, 5)).unwrap();
        resolve(&store, &pkt("10.0.0.1:2", "10.0.0.2:80", 0x02, 1)).unwrap();
        let r = resolve(&store, &pkt("10.0.0.1:3", "10.0.0.2:80", 0x02, 9)).unwrap();

        let evicted = r.evicted.unwrap();
        assert!(evicted.involves_port(2));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_evict_idle_and_clear() {
        let store = FlowStore::new(FlowConfig::default());
        resolve(&store, &pkt("10.0.0.1:1", "10.0.0.2:80", 0x02, 10)).unwrap();
        resolve(&store, &pkt("10.0.0.1:2", "10.0.0.2:80", 0x02, 100)).unwrap();

        let evicted = store.evict_idle(Utc.timestamp_opt(50, 0).unwrap());
        assert_eq!(evicted.len(), 1);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
        assert!(store.list_flows().is_empty());
    }
}
