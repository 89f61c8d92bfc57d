// SPDX-License-Identifier: GPL-2.0

//! Test packet construction
//!
//! Builds Ethernet frames carrying IPv4 with TCP or UDP, for tests,
//! benchmarks and tooling. The IPv4 header checksum is filled in; L4
//! checksums are left zero.

use std::net::Ipv4Addr;

use crate::flow::{FlowKey, ETH_HLEN, ETH_P_IP, IPPROTO_TCP, IPPROTO_UDP, IPV4_HLEN_MIN};

const TCP_HLEN: usize = 20;
const UDP_HLEN: usize = 8;

/// Builder for Ethernet/IPv4 frames
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ethertype: u16,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    ip_options: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self {
            dst_mac: [0x02, 0, 0, 0, 0, 0x02],
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            ethertype: ETH_P_IP,
            src: Ipv4Addr::new(192, 0, 2, 1),
            dst: Ipv4Addr::new(198, 51, 100, 1),
            protocol: IPPROTO_UDP,
            src_port: 40000,
            dst_port: 80,
            ttl: 64,
            ip_options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

impl PacketBuilder {
    /// UDP packet with documentation addresses
    pub fn new() -> Self {
        Self::default()
    }

    /// Packet of `flow`
    pub fn from_flow(flow: &FlowKey) -> Self {
        Self {
            src: flow.src,
            dst: flow.dst,
            protocol: flow.protocol,
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            ..Self::default()
        }
    }

    /// Set the EtherType; anything but IPv4 gets no IP header
    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = ethertype;
        self
    }

    /// Set source address and port
    pub fn src(mut self, addr: Ipv4Addr, port: u16) -> Self {
        self.src = addr;
        self.src_port = port;
        self
    }

    /// Set destination address and port
    pub fn dst(mut self, addr: Ipv4Addr, port: u16) -> Self {
        self.dst = addr;
        self.dst_port = port;
        self
    }

    /// Carry TCP
    pub fn tcp(mut self) -> Self {
        self.protocol = IPPROTO_TCP;
        self
    }

    /// Carry UDP
    pub fn udp(mut self) -> Self {
        self.protocol = IPPROTO_UDP;
        self
    }

    /// Set the IP protocol number
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// IPv4 options, padded with zeros to a multiple of 4 bytes (at most 40)
    pub fn ip_options(mut self, options: &[u8]) -> Self {
        let len = options.len().min(40);
        self.ip_options = options[..len].to_vec();
        self.ip_options.resize((len + 3) / 4 * 4, 0);
        self
    }

    /// Set the time to live
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bytes after the L4 header
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    fn l4_header(&self) -> Vec<u8> {
        let ports = |len: usize| {
            let mut h = vec![0u8; len];
            h[0..2].copy_from_slice(&self.src_port.to_be_bytes());
            h[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
            h
        };
        match self.protocol {
            IPPROTO_TCP => {
                let mut h = ports(TCP_HLEN);
                h[12] = (TCP_HLEN as u8 / 4) << 4;
                h
            }
            IPPROTO_UDP => {
                let mut h = ports(UDP_HLEN);
                let len = (UDP_HLEN + self.payload.len()) as u16;
                h[4..6].copy_from_slice(&len.to_be_bytes());
                h
            }
            _ => Vec::new(),
        }
    }

    /// Assemble the frame
    pub fn build(&self) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(128);
        pkt.extend_from_slice(&self.dst_mac);
        pkt.extend_from_slice(&self.src_mac);
        pkt.extend_from_slice(&self.ethertype.to_be_bytes());
        if self.ethertype != ETH_P_IP {
            pkt.extend_from_slice(&self.payload);
            pkt.resize(pkt.len().max(60), 0);
            return pkt;
        }

        let l4 = self.l4_header();
        let ihl = IPV4_HLEN_MIN + self.ip_options.len();
        let total = (ihl + l4.len() + self.payload.len()) as u16;
        let mut ip = vec![0u8; IPV4_HLEN_MIN];
        ip[0] = 0x40 | (ihl / 4) as u8;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[8] = self.ttl;
        ip[9] = self.protocol;
        ip[12..16].copy_from_slice(&self.src.octets());
        ip[16..20].copy_from_slice(&self.dst.octets());
        ip.extend_from_slice(&self.ip_options);
        let csum = ipv4_checksum(&ip);
        ip[10..12].copy_from_slice(&csum.to_be_bytes());

        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&l4);
        pkt.extend_from_slice(&self.payload);
        pkt
    }
}

/// Internet checksum of an IPv4 header whose checksum field is zero
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Destination address and port of a frame built by [`PacketBuilder`]
pub fn destination(pkt: &[u8]) -> Option<(Ipv4Addr, u16)> {
    let flow = FlowKey::from_packet(pkt)?;
    Some((flow.dst, flow.dst_port))
}

/// Length of the Ethernet and IPv4 headers of `pkt`
pub fn l3_header_len(pkt: &[u8]) -> Option<usize> {
    let ver_ihl = *pkt.get(ETH_HLEN)?;
    Some(ETH_HLEN + usize::from(ver_ihl & 0x0f) * 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies() {
        let pkt = PacketBuilder::new().tcp().build();
        let ip = &pkt[ETH_HLEN..ETH_HLEN + IPV4_HLEN_MIN];
        // A header including its checksum sums to 0xffff
        assert_eq!(ipv4_checksum(ip), 0);
    }

    #[test]
    fn test_layout() {
        let pkt = PacketBuilder::new()
            .tcp()
            .dst(Ipv4Addr::new(10, 1, 2, 3), 443)
            .ip_options(&[7, 7, 7])
            .payload(b"hi")
            .build();
        assert_eq!(pkt.len(), ETH_HLEN + 24 + TCP_HLEN + 2);
        assert_eq!(l3_header_len(&pkt), Some(ETH_HLEN + 24));
        assert_eq!(destination(&pkt), Some((Ipv4Addr::new(10, 1, 2, 3), 443)));
    }

    #[test]
    fn test_non_ip_padded() {
        let pkt = PacketBuilder::new().ethertype(0x86dd).build();
        assert_eq!(pkt.len(), 60);
        assert_eq!(&pkt[12..14], &[0x86, 0xdd]);
    }
}
