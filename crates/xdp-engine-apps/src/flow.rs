// SPDX-License-Identifier: GPL-2.0

//! Flow identity
//!
//! A [`FlowKey`] is the IPv4 5-tuple in the 16-byte layout the programs
//! build on their stack and use as map key:
//!
//! ```text
//! 0       4       8     10     12  13      16
//! | src   | dst   |sport|dport |pr | zero   |
//! ```
//!
//! Addresses and ports keep network byte order, exactly as they appear in
//! the packet.

use std::fmt;
use std::net::Ipv4Addr;

use xdp_engine_core::maps::Pod;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;
/// EtherType of IPv4
pub const ETH_P_IP: u16 = 0x0800;
/// Minimum IPv4 header length
pub const IPV4_HLEN_MIN: usize = 20;
/// IP protocol number of TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number of UDP
pub const IPPROTO_UDP: u8 = 17;

/// Offset of the EtherType
pub(crate) const OFF_ETH_PROTO: i16 = 12;
/// Offset of version and header length
pub(crate) const OFF_IP_VER_IHL: i16 = ETH_HLEN as i16;
/// Offset of the IP protocol
pub(crate) const OFF_IP_PROTO: i16 = ETH_HLEN as i16 + 9;
/// Offset of the source address
pub(crate) const OFF_IP_SRC: i16 = ETH_HLEN as i16 + 12;
/// Offset of the destination address
pub(crate) const OFF_IP_DST: i16 = ETH_HLEN as i16 + 16;

/// IPv4 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Source port, zero for protocols without ports
    pub src_port: u16,
    /// Destination port, zero for protocols without ports
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
}

impl FlowKey {
    /// Wire size of a key
    pub const SIZE: usize = 16;

    /// TCP flow
    pub fn tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            protocol: IPPROTO_TCP,
        }
    }

    /// UDP flow
    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            protocol: IPPROTO_UDP,
            ..Self::tcp(src, src_port, dst, dst_port)
        }
    }

    /// Whether the protocol carries ports
    pub fn has_ports(&self) -> bool {
        matches!(self.protocol, IPPROTO_TCP | IPPROTO_UDP)
    }

    /// Extract the flow of an Ethernet frame. Returns `None` for frames the
    /// packet programs do not track: non-IPv4, truncated headers, or a TCP or
    /// UDP header cut short.
    pub fn from_packet(pkt: &[u8]) -> Option<Self> {
        if pkt.len() < ETH_HLEN + IPV4_HLEN_MIN {
            return None;
        }
        if u16::from_be_bytes([pkt[12], pkt[13]]) != ETH_P_IP {
            return None;
        }
        let ver_ihl = pkt[ETH_HLEN];
        let ihl = usize::from(ver_ihl & 0x0f) * 4;
        if ver_ihl >> 4 != 4 || ihl < IPV4_HLEN_MIN {
            return None;
        }
        let ip = &pkt[ETH_HLEN..];
        let mut key = Self {
            src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
            dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
            src_port: 0,
            dst_port: 0,
            protocol: ip[9],
        };
        if key.has_ports() {
            let l4 = pkt.get(ETH_HLEN + ihl..ETH_HLEN + ihl + 4)?;
            key.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            key.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
        }
        Some(key)
    }
}

impl Pod for FlowKey {
    const SIZE: usize = FlowKey::SIZE;

    fn write_bytes(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.src.octets());
        out[4..8].copy_from_slice(&self.dst.octets());
        out[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        out[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        out[12] = self.protocol;
        out[13..16].fill(0);
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            src: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            dst: Ipv4Addr::new(b[4], b[5], b[6], b[7]),
            src_port: u16::from_be_bytes([b[8], b[9]]),
            dst_port: u16::from_be_bytes([b[10], b[11]]),
            protocol: b[12],
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            IPPROTO_TCP => "tcp".to_string(),
            IPPROTO_UDP => "udp".to_string(),
            p => format!("proto{}", p),
        };
        write!(
            f,
            "{} {}:{} -> {}:{}",
            proto, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBuilder;

    #[test]
    fn test_wire_layout() {
        let k = FlowKey::tcp(Ipv4Addr::new(10, 0, 0, 1), 0x1234, Ipv4Addr::new(10, 0, 0, 2), 80);
        let b = k.to_bytes();
        assert_eq!(&b[0..4], &[10, 0, 0, 1]);
        assert_eq!(&b[8..10], &[0x12, 0x34]);
        assert_eq!(&b[10..12], &[0, 80]);
        assert_eq!(b[12], IPPROTO_TCP);
        assert_eq!(&b[13..], &[0, 0, 0]);
        assert_eq!(FlowKey::from_bytes(&b), Some(k));
    }

    #[test]
    fn test_from_packet_with_options() {
        let k = FlowKey::udp(Ipv4Addr::new(1, 2, 3, 4), 53, Ipv4Addr::new(5, 6, 7, 8), 5353);
        let pkt = PacketBuilder::from_flow(&k).ip_options(&[1, 1, 1, 1, 1, 1, 1, 1]).build();
        assert_eq!(FlowKey::from_packet(&pkt), Some(k));
    }

    #[test]
    fn test_untracked_frames() {
        let arp = PacketBuilder::new().ethertype(0x0806).build();
        assert_eq!(FlowKey::from_packet(&arp), None);

        let k = FlowKey::tcp(Ipv4Addr::LOCALHOST, 1, Ipv4Addr::LOCALHOST, 2);
        let mut pkt = PacketBuilder::from_flow(&k).build();
        pkt.truncate(ETH_HLEN + IPV4_HLEN_MIN + 2);
        assert_eq!(FlowKey::from_packet(&pkt), None);
    }

    #[test]
    fn test_portless_protocol() {
        let mut k = FlowKey::tcp(Ipv4Addr::new(9, 9, 9, 9), 7, Ipv4Addr::new(8, 8, 8, 8), 7);
        k.protocol = 1;
        let pkt = PacketBuilder::from_flow(&k).build();
        let parsed = FlowKey::from_packet(&pkt).unwrap();
        assert_eq!((parsed.src_port, parsed.dst_port), (0, 0));
        assert_eq!(parsed.protocol, 1);
    }
}
