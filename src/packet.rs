//! Minimal IPv4/IPv6 header inspection.
//!
//! The data plane only needs the destination address for routing and the
//! protocol/src/dst triple for logging; packets are never modified.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported IP version {0}")]
    Version(u8),
    #[error("IPv4 header length {ihl} exceeds packet ({len} bytes)")]
    HeaderLength { ihl: usize, len: usize },
}

/// Decoded header fields of one IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Offset of the transport payload within the raw packet.
    pub payload_offset: usize,
}

impl IpHeader {
    pub fn protocol_name(&self) -> &'static str {
        match self.protocol {
            IPPROTO_ICMP => "ICMP",
            IPPROTO_TCP => "TCP",
            IPPROTO_UDP => "UDP",
            _ => "Unknown",
        }
    }
}

/// Parse the fixed header of an IPv4 or IPv6 packet.
pub fn parse(raw: &[u8]) -> Result<IpHeader, PacketError> {
    if raw.len() < 20 {
        return Err(PacketError::TooShort(raw.len()));
    }
    match raw[0] >> 4 {
        4 => parse_v4(raw),
        6 => parse_v6(raw),
        v => Err(PacketError::Version(v)),
    }
}

fn parse_v4(raw: &[u8]) -> Result<IpHeader, PacketError> {
    let ihl = ((raw[0] & 0x0f) as usize) * 4;
    if raw.len() < ihl {
        return Err(PacketError::HeaderLength { ihl, len: raw.len() });
    }
    let src: [u8; 4] = raw[12..16].try_into().expect("slice length");
    let dst: [u8; 4] = raw[16..20].try_into().expect("slice length");
    Ok(IpHeader {
        version: 4,
        protocol: raw[9],
        src: IpAddr::V4(Ipv4Addr::from(src)),
        dst: IpAddr::V4(Ipv4Addr::from(dst)),
        payload_offset: ihl,
    })
}

fn parse_v6(raw: &[u8]) -> Result<IpHeader, PacketError> {
    if raw.len() < 40 {
        return Err(PacketError::TooShort(raw.len()));
    }
    let src: [u8; 16] = raw[8..24].try_into().expect("slice length");
    let dst: [u8; 16] = raw[24..40].try_into().expect("slice length");
    Ok(IpHeader {
        version: 6,
        protocol: raw[6],
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        payload_offset: 40,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4 packet: 20-byte header, given protocol and addresses.
    pub(crate) fn v4_packet(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut pkt = vec![0u8; total];
        pkt[0] = 0x45;
        pkt[2] = (total >> 8) as u8;
        pkt[3] = total as u8;
        pkt[8] = 64; // TTL
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn parses_ipv4_fields() {
        let pkt = v4_packet(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.version, 4);
        assert_eq!(hdr.protocol, IPPROTO_UDP);
        assert_eq!(hdr.src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(hdr.dst, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(hdr.payload_offset, 20);
        assert_eq!(hdr.protocol_name(), "UDP");
    }

    #[test]
    fn parses_ipv4_with_options() {
        // IHL of 6 words: 24-byte header.
        let mut pkt = vec![0u8; 24];
        pkt[0] = 0x46;
        pkt[9] = IPPROTO_TCP;
        pkt[12..16].copy_from_slice(&[192, 168, 1, 1]);
        pkt[16..20].copy_from_slice(&[192, 168, 1, 2]);
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.payload_offset, 24);
    }

    #[test]
    fn parses_ipv6_fields() {
        let mut pkt = vec![0u8; 48];
        pkt[0] = 0x60;
        pkt[6] = IPPROTO_UDP;
        pkt[8..24].copy_from_slice(&[0xfd; 16]);
        pkt[24..40].copy_from_slice(&[0xfe; 16]);
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.version, 6);
        assert_eq!(hdr.protocol, IPPROTO_UDP);
        assert_eq!(hdr.payload_offset, 40);
        assert_eq!(hdr.dst, IpAddr::V6(Ipv6Addr::from([0xfe; 16])));
    }

    #[test]
    fn rejects_short_and_bogus() {
        assert!(matches!(parse(&[0u8; 19]), Err(PacketError::TooShort(19))));
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x50;
        assert!(matches!(parse(&pkt), Err(PacketError::Version(5))));
        // IPv4 claiming a header longer than the buffer
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x4f; // IHL 15 => 60-byte header
        assert!(matches!(parse(&pkt), Err(PacketError::HeaderLength { .. })));
        // IPv6 needs its full 40-byte header
        let mut pkt = vec![0u8; 30];
        pkt[0] = 0x60;
        assert!(matches!(parse(&pkt), Err(PacketError::TooShort(30))));
    }
}
