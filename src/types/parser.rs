//! Frame decoding into [`BasicPacket`]
//!
//! Peels Ethernet → IP → TCP/UDP with etherparse and keeps only what the
//! flow engine needs.

use chrono::{DateTime, Utc};
use etherparse::{LinkSlice, NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};

use super::packet::{BasicPacket, TcpFlags, TcpHeaders, TransportHeaders, TransportProtocol};
use crate::error::{FlowError, Result};

/// Link layer of the frames handed to [`parse_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Ethernet,
    /// Raw IPv4/IPv6 without a link header (loopback captures, NFQUEUE)
    RawIp,
}

/// Decode one captured frame
pub fn parse_frame(raw: &[u8], link: LinkType, timestamp: DateTime<Utc>) -> Result<BasicPacket> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(raw),
        LinkType::RawIp => SlicedPacket::from_ip(raw),
    }
    .map_err(|e| FlowError::Parse(e.to_string()))?;

    let (src_mac, dst_mac) = match &sliced.link {
        Some(LinkSlice::Ethernet2(eth)) => (Some(eth.source()), Some(eth.destination())),
        _ => (None, None),
    };

    let (src_ip, dst_ip, total_length, ip_protocol) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.total_len(),
                header.protocol().0,
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.payload_length().saturating_add(40),
                header.next_header().0,
            )
        }
        _ => return Err(FlowError::Parse("no IP layer found in frame".into())),
    };

    let (protocol, src_port, dst_port, headers, payload) = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let headers = TcpHeaders {
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                },
                window: tcp.window_size(),
                data_offset: tcp.data_offset(),
                total_length,
                checksum: tcp.checksum(),
            };
            (
                TransportProtocol::Tcp,
                tcp.source_port(),
                tcp.destination_port(),
                TransportHeaders::Tcp(headers),
                tcp.payload().to_vec(),
            )
        }
        Some(TransportSlice::Udp(udp)) => (
            TransportProtocol::Udp,
            udp.source_port(),
            udp.destination_port(),
            TransportHeaders::Udp { length: udp.length() },
            udp.payload().to_vec(),
        ),
        _ => (
            TransportProtocol::from(ip_protocol),
            0,
            0,
            TransportHeaders::None,
            Vec::new(),
        ),
    };

    Ok(BasicPacket {
        timestamp,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        src_mac,
        dst_mac,
        protocol,
        headers,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn test_parse_empty_fails() {
        let result = parse_frame(&[], LinkType::Ethernet, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_ethernet_tcp() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 10], [192, 168, 1, 20], 64)
            .tcp(40000, 8080, 1000, 4096)
            .psh()
            .ack(77);
        let payload = b"GET / HTTP/1.1\r\n\r\n";
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();

        let pkt = parse_frame(&frame, LinkType::Ethernet, Utc::now()).unwrap();
        assert_eq!(pkt.protocol, TransportProtocol::Tcp);
        assert_eq!(pkt.src_port, 40000);
        assert_eq!(pkt.dst_port, 8080);
        assert_eq!(pkt.src_mac, Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(pkt.payload, payload);

        let tcp = pkt.tcp_headers().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 77);
        assert!(tcp.flags.psh && tcp.flags.ack);
        assert!(pkt.check().is_ok());
    }

    #[test]
    fn test_parse_raw_ip_udp() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(5353, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"q").unwrap();

        let pkt = parse_frame(&frame, LinkType::RawIp, Utc::now()).unwrap();
        assert_eq!(pkt.protocol, TransportProtocol::Udp);
        assert_eq!(pkt.src_mac, None);
        assert!(pkt.tcp_headers().is_none());
    }
}
