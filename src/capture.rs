//! Packet sources
//!
//! Supports:
//! - PCAP file replay
//! - In-memory packet lists (tests, synthetic traffic)

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tracing::{debug, info, warn};

use crate::flow::{FlowManager, IngestOutcome};
use crate::types::{parse_frame, BasicPacket, LinkType};

/// Trait for packet sources
pub trait CaptureSource: Send {
    /// Next decoded packet, `None` at end of input
    fn next_packet(&mut self) -> anyhow::Result<Option<BasicPacket>>;

    /// Capture statistics
    fn stats(&self) -> CaptureStats;
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames read from the source
    pub received: u64,
    /// Frames that could not be decoded
    pub undecodable: u64,
    /// Captured bytes
    pub bytes: u64,
}

/// Map a pcap link type onto the decoder's
pub fn link_type(datalink: DataLink) -> anyhow::Result<LinkType> {
    match datalink {
        DataLink::ETHERNET => Ok(LinkType::Ethernet),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Ok(LinkType::RawIp),
        other => anyhow::bail!("Unsupported link type {:?}", other),
    }
}

fn capture_time(ts: Duration) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.as_secs() as i64, ts.subsec_nanos())
        .single()
        .unwrap_or_default()
}

/// PCAP file replay
pub struct PcapFileCapture {
    path: PathBuf,
    reader: PcapReader<BufReader<File>>,
    link: LinkType,
    stats: CaptureStats,
}

impl PcapFileCapture {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Failed to open capture {}", path.display()))?;
        let reader = PcapReader::new(BufReader::new(file))
            .with_context(|| format!("Failed to read pcap header of {}", path.display()))?;
        let link = link_type(reader.header().datalink)?;
        info!("Replaying {} ({:?})", path.display(), link);

        Ok(Self {
            path,
            reader,
            link,
            stats: CaptureStats::default(),
        })
    }

    /// Override the link type from the file header
    pub fn with_link_type(mut self, link: LinkType) -> Self {
        self.link = link;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSource for PcapFileCapture {
    fn next_packet(&mut self) -> anyhow::Result<Option<BasicPacket>> {
        while let Some(frame) = self.reader.next_packet() {
            let frame = frame.with_context(|| format!("Corrupt record in {}", self.path.display()))?;
            self.stats.received += 1;
            self.stats.bytes += frame.data.len() as u64;

            match parse_frame(&frame.data, self.link, capture_time(frame.timestamp)) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => {
                    self.stats.undecodable += 1;
                    debug!("Skipping frame {}: {}", self.stats.received, e);
                }
            }
        }
        Ok(None)
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }
}

/// Replays packets from memory
#[derive(Debug, Default)]
pub struct VecCapture {
    packets: VecDeque<BasicPacket>,
    stats: CaptureStats,
}

impl VecCapture {
    pub fn new(packets: Vec<BasicPacket>) -> Self {
        Self {
            packets: packets.into(),
            stats: CaptureStats::default(),
        }
    }
}

impl CaptureSource for VecCapture {
    fn next_packet(&mut self) -> anyhow::Result<Option<BasicPacket>> {
        let packet = self.packets.pop_front();
        if let Some(p) = &packet {
            self.stats.received += 1;
            self.stats.bytes += p.payload.len() as u64;
        }
        Ok(packet)
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }
}

/// Pump a source into the manager until it ends or the session is stopped.
/// Returns the number of packets ingested.
pub fn run_capture(source: &mut dyn CaptureSource, manager: &FlowManager) -> anyhow::Result<u64> {
    let token = manager.cancel_token();
    let mut ingested = 0u64;

    while !token.is_cancelled() {
        let Some(packet) = source.next_packet()? else {
            break;
        };
        if let IngestOutcome::Dropped(e) = manager.ingest(packet) {
            warn!("Packet {} dropped: {}", ingested + 1, e);
        }
        ingested += 1;
    }

    let stats = source.stats();
    info!(
        "Capture finished: {} packets ingested, {} frames, {} undecodable",
        ingested, stats.received, stats.undecodable
    );
    Ok(ingested)
}
