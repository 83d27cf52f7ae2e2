use chrono::{DateTime, Utc};
use log::{log_enabled, trace, Level};
use pcap::{Linktype, PacketHeader};
use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    Packet as PnetPacket,
};
use std::net::IpAddr;

use crate::models::record::NetworkRecord;
use crate::utils::error::{AppError, AppResult};

/// Largest Ethernet frame that travels unsegmented
pub const MAX_FRAME_LEN: u32 = 1518;

/// TCP payload carried per segment on a 1500-byte MTU path
pub const MSS: u32 = 1460;

/// Per-segment header estimate for non-TCP traffic: Ethernet 18 + IP 20 + UDP 8
pub const NON_TCP_HEADER_LEN: u32 = 46;

/// Ethernet frame check sequence, not present in captured bytes
const FCS_LEN: u32 = 4;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const LOOPBACK_HEADER_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Fields extracted from one captured frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub create_time: DateTime<Utc>,
    pub size: i32,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
}

impl DecodedPacket {
    /// Stamp with `id` and attach the capturing device
    pub fn into_record(self, id: u64, device: &str) -> NetworkRecord {
        NetworkRecord {
            id,
            device: device.to_string(),
            create_time: self.create_time,
            size: self.size,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
        }
    }
}

/// Network layer facts needed for addressing and size adjustment
struct NetworkLayer {
    src: IpAddr,
    dst: IpAddr,
    /// Link + IP + TCP header bytes when the packet is TCP
    tcp_headers: Option<u32>,
}

/// Wire length adjusted upward for the extra headers a segmented flow would
/// have carried. Frames up to [`MAX_FRAME_LEN`] are returned unchanged.
pub fn adjusted_size(wire_len: u32, tcp_headers: Option<u32>) -> i32 {
    if wire_len <= MAX_FRAME_LEN {
        return wire_len as i32;
    }

    let (header_len, payload_len) = match tcp_headers {
        Some(headers) => (headers + FCS_LEN, wire_len.saturating_sub(headers)),
        None => (NON_TCP_HEADER_LEN, wire_len - NON_TCP_HEADER_LEN),
    };
    let segments = (payload_len as u64 + MSS as u64 - 1) / MSS as u64;
    let extra = header_len as u64 * segments.saturating_sub(1);

    (wire_len as u64 + extra).min(i32::MAX as u64) as i32
}

/// Parses raw frames of one link type into normalized records
#[derive(Debug, Clone, Copy)]
pub struct PacketParser {
    linktype: Linktype,
}

impl PacketParser {
    /// Create a new packet parser for frames of `linktype`
    pub fn new(linktype: Linktype) -> Self {
        Self { linktype }
    }

    /// Decode timestamp, adjusted size and addresses of one frame
    pub fn parse_packet(&self, header: &PacketHeader, data: &[u8]) -> AppResult<DecodedPacket> {
        let create_time = DateTime::from_timestamp(
            header.ts.tv_sec as i64,
            (header.ts.tv_usec as u32).saturating_mul(1000),
        )
        .ok_or_else(|| {
            AppError::PacketParsingError(format!(
                "timestamp out of range: {}.{}",
                header.ts.tv_sec, header.ts.tv_usec
            ))
        })?;

        let network = self.network_layer(data)?;

        if log_enabled!(Level::Trace) {
            trace!(
                "Decoded frame: len={} caplen={} src={:?} dst={:?} tcp_headers={:?}",
                header.len,
                header.caplen,
                network.as_ref().map(|n| n.src),
                network.as_ref().map(|n| n.dst),
                network.as_ref().and_then(|n| n.tcp_headers)
            );
        }

        Ok(DecodedPacket {
            create_time,
            size: adjusted_size(header.len, network.as_ref().and_then(|n| n.tcp_headers)),
            src_ip: network.as_ref().map(|n| n.src),
            dst_ip: network.as_ref().map(|n| n.dst),
        })
    }

    /// Strip the link header; `Ok(None)` for frames that carry no IP
    fn network_layer(&self, data: &[u8]) -> AppResult<Option<NetworkLayer>> {
        match self.linktype {
            Linktype::ETHERNET => self.parse_ethernet(data),
            Linktype::LINUX_SLL => {
                if data.len() < SLL_HEADER_LEN {
                    return Err(AppError::PacketParsingError(
                        "Failed to parse Linux cooked header".to_string(),
                    ));
                }
                let protocol = EtherType(u16::from_be_bytes([data[14], data[15]]));
                self.parse_by_ethertype(protocol, &data[SLL_HEADER_LEN..], SLL_HEADER_LEN)
            }
            Linktype::NULL | Linktype::LOOP => {
                if data.len() < LOOPBACK_HEADER_LEN {
                    return Err(AppError::PacketParsingError(
                        "Failed to parse loopback header".to_string(),
                    ));
                }
                self.parse_by_version(&data[LOOPBACK_HEADER_LEN..], LOOPBACK_HEADER_LEN)
            }
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => self.parse_by_version(data, 0),
            _ => Ok(None),
        }
    }

    fn parse_ethernet(&self, data: &[u8]) -> AppResult<Option<NetworkLayer>> {
        let eth_packet = EthernetPacket::new(data).ok_or_else(|| {
            AppError::PacketParsingError("Failed to parse Ethernet packet".to_string())
        })?;

        let ethertype = eth_packet.get_ethertype();
        if ethertype == EtherTypes::Vlan {
            let payload = eth_packet.payload();
            if payload.len() < VLAN_TAG_LEN {
                return Err(AppError::PacketParsingError(
                    "Failed to parse VLAN tag".to_string(),
                ));
            }
            let inner = EtherType(u16::from_be_bytes([payload[2], payload[3]]));
            return self.parse_by_ethertype(
                inner,
                &payload[VLAN_TAG_LEN..],
                ETHERNET_HEADER_LEN + VLAN_TAG_LEN,
            );
        }

        self.parse_by_ethertype(ethertype, eth_packet.payload(), ETHERNET_HEADER_LEN)
    }

    fn parse_by_ethertype(
        &self,
        ethertype: EtherType,
        data: &[u8],
        link_len: usize,
    ) -> AppResult<Option<NetworkLayer>> {
        match ethertype {
            EtherTypes::Ipv4 => self.parse_ipv4(data, link_len).map(Some),
            EtherTypes::Ipv6 => self.parse_ipv6(data, link_len).map(Some),
            _ => Ok(None),
        }
    }

    fn parse_by_version(&self, data: &[u8], link_len: usize) -> AppResult<Option<NetworkLayer>> {
        match data.first().map(|b| b >> 4) {
            Some(4) => self.parse_ipv4(data, link_len).map(Some),
            Some(6) => self.parse_ipv6(data, link_len).map(Some),
            _ => Ok(None),
        }
    }

    /// Parse IPv4 packet
    fn parse_ipv4(&self, data: &[u8], link_len: usize) -> AppResult<NetworkLayer> {
        let ipv4_packet = Ipv4Packet::new(data).ok_or_else(|| {
            AppError::PacketParsingError("Failed to parse IPv4 packet".to_string())
        })?;

        let header_len = ipv4_packet.get_header_length() as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > data.len() {
            return Err(AppError::PacketParsingError(format!(
                "Invalid IPv4 header length {}",
                header_len
            )));
        }

        Ok(NetworkLayer {
            src: IpAddr::V4(ipv4_packet.get_source()),
            dst: IpAddr::V4(ipv4_packet.get_destination()),
            tcp_headers: self.tcp_headers(
                ipv4_packet.get_next_level_protocol(),
                &data[header_len..],
                link_len + header_len,
            ),
        })
    }

    /// Parse IPv6 packet
    fn parse_ipv6(&self, data: &[u8], link_len: usize) -> AppResult<NetworkLayer> {
        let ipv6_packet = Ipv6Packet::new(data).ok_or_else(|| {
            AppError::PacketParsingError("Failed to parse IPv6 packet".to_string())
        })?;

        Ok(NetworkLayer {
            src: IpAddr::V6(ipv6_packet.get_source()),
            dst: IpAddr::V6(ipv6_packet.get_destination()),
            tcp_headers: self.tcp_headers(
                ipv6_packet.get_next_header(),
                &data[IPV6_HEADER_LEN..],
                link_len + IPV6_HEADER_LEN,
            ),
        })
    }

    /// Total header bytes up to and including TCP, if this is a TCP segment
    fn tcp_headers(&self, proto: IpNextHeaderProtocol, data: &[u8], below: usize) -> Option<u32> {
        if proto != IpNextHeaderProtocols::Tcp {
            return None;
        }
        // A header cut short by the snapshot length is treated as non-TCP.
        let tcp_packet = TcpPacket::new(data)?;
        let tcp_len = tcp_packet.get_data_offset() as usize * 4;
        Some((below + tcp_len) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn header(secs: i64, len: u32, caplen: u32) -> PacketHeader {
        PacketHeader {
            ts: libc::timeval {
                tv_sec: secs as _,
                tv_usec: 250_000 as _,
            },
            caplen,
            len,
        }
    }

    /// Ethernet + IPv4 (20 bytes) + TCP (20 bytes) or UDP (8 bytes) frame
    fn frame(proto: u8, src: [u8; 4], dst: [u8; 4], payload_len: usize) -> Vec<u8> {
        let l4_len = if proto == 6 { 20 } else { 8 };
        let ip_total = 20 + l4_len + payload_len;
        let mut f = vec![0u8; 14];
        f[12] = 0x08;
        f[13] = 0x00;
        f.extend_from_slice(&[0x45, 0, (ip_total >> 8) as u8, ip_total as u8, 0, 0, 0, 0, 64, proto, 0, 0]);
        f.extend_from_slice(&src);
        f.extend_from_slice(&dst);
        let mut l4 = vec![0u8; l4_len];
        if proto == 6 {
            l4[12] = 5 << 4;
        }
        f.extend_from_slice(&l4);
        f.extend(std::iter::repeat(0xab).take(payload_len));
        f
    }

    #[test]
    fn small_frames_are_not_adjusted() {
        assert_eq!(adjusted_size(60, Some(54)), 60);
        assert_eq!(adjusted_size(1518, Some(54)), 1518);
        assert_eq!(adjusted_size(1518, None), 1518);
    }

    #[test]
    fn oversized_tcp_frame_counts_extra_segment_headers() {
        // 2946 bytes of payload need three 1460-byte segments.
        assert_eq!(adjusted_size(3000, Some(54)), 3000 + 58 * 2);
    }

    #[test]
    fn oversized_non_tcp_frame_uses_fixed_header_estimate() {
        assert_eq!(adjusted_size(3000, None), 3000 + 46 * 2);
        assert_eq!(adjusted_size(1519, None), 1519 + 46);
    }

    #[test]
    fn parses_ipv4_tcp_addresses_and_size() {
        let parser = PacketParser::new(Linktype::ETHERNET);
        let data = frame(6, [10, 0, 0, 1], [10, 0, 0, 2], 2946);
        assert_eq!(data.len(), 3000);

        let decoded = parser
            .parse_packet(&header(1_700_000_000, 3000, 3000), &data)
            .unwrap();
        assert_eq!(decoded.src_ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(decoded.dst_ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert_eq!(decoded.size, 3116);
        assert_eq!(decoded.create_time.timestamp(), 1_700_000_000);
        assert_eq!(decoded.create_time.timestamp_subsec_micros(), 250_000);
    }

    #[test]
    fn snapped_tcp_frame_still_uses_wire_length() {
        let parser = PacketParser::new(Linktype::ETHERNET);
        let data = frame(6, [10, 0, 0, 1], [10, 0, 0, 2], 2946);
        let decoded = parser
            .parse_packet(&header(1_700_000_000, 3000, 96), &data[..96])
            .unwrap();
        assert_eq!(decoded.size, 3116);
    }

    #[test]
    fn udp_frame_is_not_tcp() {
        let parser = PacketParser::new(Linktype::ETHERNET);
        let data = frame(17, [192, 168, 1, 5], [8, 8, 8, 8], 100);
        let decoded = parser
            .parse_packet(&header(1_700_000_000, data.len() as u32, data.len() as u32), &data)
            .unwrap();
        assert_eq!(decoded.size, data.len() as i32);
        assert_eq!(decoded.dst_ip, Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn non_ip_frame_has_no_addresses() {
        let parser = PacketParser::new(Linktype::ETHERNET);
        let mut data = vec![0u8; 60];
        data[12] = 0x08;
        data[13] = 0x06; // ARP
        let decoded = parser.parse_packet(&header(1, 60, 60), &data).unwrap();
        assert_eq!(decoded.src_ip, None);
        assert_eq!(decoded.dst_ip, None);
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let parser = PacketParser::new(Linktype::ETHERNET);
        assert!(parser.parse_packet(&header(1, 6, 6), &[0u8; 6]).is_err());

        let data = frame(6, [10, 0, 0, 1], [10, 0, 0, 2], 0);
        assert!(parser.parse_packet(&header(1, 20, 20), &data[..20]).is_err());
    }

    #[test]
    fn raw_ip_linktype_has_no_link_header() {
        let parser = PacketParser::new(Linktype::RAW);
        let data = frame(6, [1, 1, 1, 1], [2, 2, 2, 2], 10);
        let record = parser
            .parse_packet(&header(5, 50, 50), &data[14..])
            .unwrap()
            .into_record(7, "tun0");
        assert_eq!(record.id, 7);
        assert_eq!(record.device, "tun0");
        assert_eq!(record.src_ip, Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
    }
}
