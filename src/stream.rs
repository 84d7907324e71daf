//! Per-direction stream reassembly
//!
//! Payload bytes are appended in packet-arrival order. Sequence numbers are
//! not used for resequencing: local capture delivers segments in link order.
//! Each contributing packet is remembered as a [`Segment`] so that message
//! boundaries found later can be mapped back to packets for timing.

use chrono::{DateTime, Utc};

use crate::error::{FlowError, Result};

/// One packet's contribution to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Stream offset of the first byte
    pub offset: usize,
    pub len: usize,
    pub timestamp: DateTime<Utc>,
    /// Index of the packet in the flow's packet list
    pub packet_index: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Borrowed view of a reassembled stream
#[derive(Debug, Clone, Copy)]
pub struct StreamView<'a> {
    pub bytes: &'a [u8],
    pub segments: &'a [Segment],
}

impl<'a> StreamView<'a> {
    pub fn new(bytes: &'a [u8], segments: &'a [Segment]) -> Self {
        Self { bytes, segments }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Index of the segment holding byte `offset`
    pub fn segment_index_at(&self, offset: usize) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.end() <= offset);
        self.segments
            .get(idx)
            .filter(|s| s.offset <= offset && offset < s.end())
            .map(|_| idx)
    }

    pub fn segment_at(&self, offset: usize) -> Option<&'a Segment> {
        self.segment_index_at(offset).map(|i| &self.segments[i])
    }

    /// The stream as it stood after its first `segments` packets
    pub fn prefix(self, segments: usize) -> Self {
        let segments = &self.segments[..segments.min(self.segments.len())];
        let end = segments.last().map(|s| s.end()).unwrap_or(0);
        Self {
            bytes: &self.bytes[..end.min(self.bytes.len())],
            segments,
        }
    }

    /// Capture time of the packet that delivered the last byte before `end`
    pub fn completed_at(&self, end: usize) -> Option<DateTime<Utc>> {
        end.checked_sub(1)
            .and_then(|last| self.segment_at(last))
            .map(|s| s.timestamp)
    }
}

/// Byte-stream accumulator for one direction of one flow
#[derive(Debug)]
pub struct StreamReassembler {
    segments: Vec<Segment>,
    /// Payloads fed since the last concatenation
    pending: Vec<Vec<u8>>,
    bytes: Vec<u8>,
    total_len: usize,
    /// Maximum bytes accepted
    limit: usize,
    rebuilds: u64,
}

impl StreamReassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            segments: Vec::new(),
            pending: Vec::new(),
            bytes: Vec::new(),
            total_len: 0,
            limit,
            rebuilds: 0,
        }
    }

    /// Append one packet's payload. Empty payloads are ignored.
    pub fn feed(
        &mut self,
        payload: &[u8],
        timestamp: DateTime<Utc>,
        packet_index: usize,
    ) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if self.total_len + payload.len() > self.limit {
            return Err(FlowError::StreamOverflow { limit: self.limit });
        }

        self.segments.push(Segment {
            offset: self.total_len,
            len: payload.len(),
            timestamp,
            packet_index,
        });
        self.total_len += payload.len();
        self.pending.push(payload.to_vec());
        Ok(())
    }

    /// Total bytes fed so far
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Concatenated stream; only rebuilt when packets were fed since the last call
    pub fn bytes(&mut self) -> &[u8] {
        if !self.pending.is_empty() {
            self.bytes.reserve(self.total_len - self.bytes.len());
            for chunk in self.pending.drain(..) {
                self.bytes.extend_from_slice(&chunk);
            }
            self.rebuilds += 1;
        }
        &self.bytes
    }

    pub fn view(&mut self) -> StreamView<'_> {
        self.bytes();
        StreamView::new(&self.bytes, &self.segments)
    }

    /// Number of times `bytes()` had to concatenate new data
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_bytes_is_concatenation_in_feed_order() {
        let mut stream = StreamReassembler::new(1024);
        stream.feed(b"P1-", ts(1), 0).unwrap();
        stream.feed(b"P2-", ts(2), 1).unwrap();
        stream.feed(b"P3", ts(3), 2).unwrap();
        assert_eq!(stream.bytes(), b"P1-P2-P3");
        assert_eq!(stream.len(), 8);
    }

    #[test]
    fn test_bytes_is_memoized() {
        let mut stream = StreamReassembler::new(1024);
        stream.feed(b"abc", ts(1), 0).unwrap();
        stream.bytes();
        stream.bytes();
        assert_eq!(stream.rebuilds(), 1);

        stream.feed(b"def", ts(2), 1).unwrap();
        assert_eq!(stream.bytes(), b"abcdef");
        assert_eq!(stream.rebuilds(), 2);
    }

    #[test]
    fn test_empty_payload_is_not_a_segment() {
        let mut stream = StreamReassembler::new(1024);
        stream.feed(b"", ts(1), 0).unwrap();
        assert!(stream.is_empty());
        assert!(stream.segments().is_empty());
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut stream = StreamReassembler::new(4);
        stream.feed(b"abc", ts(1), 0).unwrap();
        let err = stream.feed(b"de", ts(2), 1).unwrap_err();
        assert_eq!(err, FlowError::StreamOverflow { limit: 4 });
        assert_eq!(stream.bytes(), b"abc");
    }

    #[test]
    fn test_segment_lookup_and_timing() {
        let mut stream = StreamReassembler::new(1024);
        stream.feed(b"aaaa", ts(10), 3).unwrap();
        stream.feed(b"bb", ts(20), 5).unwrap();
        let view = stream.view();

        assert_eq!(view.segment_index_at(0), Some(0));
        assert_eq!(view.segment_index_at(3), Some(0));
        assert_eq!(view.segment_index_at(4), Some(1));
        assert_eq!(view.segment_index_at(6), None);
        assert_eq!(view.segment_at(5).map(|s| s.packet_index), Some(5));

        assert_eq!(view.completed_at(4), Some(ts(10)));
        assert_eq!(view.completed_at(5), Some(ts(20)));
        assert_eq!(view.completed_at(0), None);
    }

    #[test]
    fn test_prefix_view() {
        let mut stream = StreamReassembler::new(1024);
        stream.feed(b"aaaa", ts(1), 0).unwrap();
        stream.feed(b"bb", ts(2), 2).unwrap();
        let view = stream.view();

        let first = view.prefix(1);
        assert_eq!(first.bytes, b"aaaa");
        assert_eq!(first.segments.len(), 1);
        assert!(view.prefix(0).is_empty());
        assert_eq!(view.prefix(9).bytes, b"aaaabb");
    }
}
