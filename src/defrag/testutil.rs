// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Frame builders shared by the unit and engine tests.
use bytes::Bytes;
use macaddr::MacAddr6;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use zerocopy::{FromZeros, IntoBytes};

use crate::constants::*;
use crate::defrag::element::{ElementPool, FragmentElement};
use crate::defrag::protocol::{
    EthernetHeader, FragmentType, FullPacket, GroupId, HeaderSnapshot, Ipv4Header, Ipv6Header,
    PacketView,
};

pub const UDP: u8 = 17;

/// Addresses and header fields shared by every fragment of one datagram.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_mac: MacAddr6,
    pub dst_mac: MacAddr6,
    pub protocol: u8,
    pub ident: u32,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub ttl: u8,
    /// IPv6 extension headers placed before the fragment header as
    /// (type, length in 8-byte units minus one).
    pub extensions: Vec<(u8, u8)>,
}

impl FlowSpec {
    pub fn v4(ident: u32) -> Self {
        Self {
            src: IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(192, 168, 10, 2)),
            src_mac: MacAddr6::new(0x02, 0, 0, 0, 0, 0x01),
            dst_mac: MacAddr6::new(0x02, 0, 0, 0, 0, 0x02),
            protocol: UDP,
            ident: ident & 0xFFFF,
            traffic_class: 0x10,
            flow_label: 0,
            ttl: 61,
            extensions: Vec::new(),
        }
    }

    pub fn v6(ident: u32) -> Self {
        Self {
            src: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            dst: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)),
            src_mac: MacAddr6::new(0x02, 0, 0, 0, 0, 0x11),
            dst_mac: MacAddr6::new(0x02, 0, 0, 0, 0, 0x12),
            protocol: UDP,
            ident,
            traffic_class: 0xB8,
            flow_label: 0x5_4321,
            ttl: 57,
            extensions: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<(u8, u8)>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_src(mut self, src: IpAddr) -> Self {
        self.src = src;
        self
    }

    pub fn frag_type(&self) -> FragmentType {
        match self.src {
            IpAddr::V4(_) => FragmentType::Ipv4,
            IpAddr::V6(_) => FragmentType::Ipv6,
        }
    }

    pub fn group_id(&self) -> GroupId {
        GroupId {
            src: self.src,
            dst: self.dst,
            protocol: self.protocol,
            identification: self.ident,
        }
    }

    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            src_mac: self.src_mac,
            dst_mac: self.dst_mac,
            src_ip: self.src,
            dst_ip: self.dst,
            next_protocol: self.protocol,
            traffic_class: self.traffic_class,
            hop_limit: self.ttl,
            flow_label: self.flow_label,
            identification: self.ident,
        }
    }

    /// A fragment frame for this flow's IP version.
    pub fn fragment(&self, offset_units: u16, more_frags: bool, payload: &[u8]) -> Vec<u8> {
        match self.frag_type() {
            FragmentType::Ipv4 => ipv4_fragment(self, offset_units, more_frags, payload),
            FragmentType::Ipv6 => ipv6_fragment(self, offset_units, more_frags, payload),
        }
    }
}

fn ethernet(flow: &FlowSpec, ether_type: u16) -> Vec<u8> {
    let mut eth = EthernetHeader::new_zeroed();
    eth.dst_mac.copy_from_slice(flow.dst_mac.as_bytes());
    eth.src_mac.copy_from_slice(flow.src_mac.as_bytes());
    eth.ether_type.set(ether_type);
    eth.as_bytes().to_vec()
}

fn octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Offset 0 with `more_frags` false yields an ordinary unfragmented packet.
pub fn ipv4_fragment(
    flow: &FlowSpec,
    offset_units: u16,
    more_frags: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = ethernet(flow, ETHERTYPE_IPV4);
    let mut ip = Ipv4Header::new_zeroed();
    ip.version_ihl = 0x45;
    ip.tos = flow.traffic_class;
    ip.total_length.set((IPV4_HEADER_SIZE + payload.len()) as u16);
    ip.identification.set(flow.ident as u16);
    let mf = if more_frags { IPV4_MORE_FRAGMENTS } else { 0 };
    ip.flags_fragment.set(mf | (offset_units & IPV4_OFFSET_MASK));
    ip.ttl = flow.ttl;
    ip.protocol = flow.protocol;
    ip.src_addr.copy_from_slice(&octets(flow.src));
    ip.dst_addr.copy_from_slice(&octets(flow.dst));
    ip.update_checksum();
    frame.extend_from_slice(ip.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv6_header(flow: &FlowSpec, next_header: u8, payload_len: usize) -> Ipv6Header {
    let mut ip = Ipv6Header::new_zeroed();
    ip.set_version_traffic_flow(flow.traffic_class, flow.flow_label);
    ip.payload_length.set(payload_len as u16);
    ip.next_header = next_header;
    ip.hop_limit = flow.ttl;
    ip.src_addr.copy_from_slice(&octets(flow.src));
    ip.dst_addr.copy_from_slice(&octets(flow.dst));
    ip
}

pub fn ipv6_fragment(
    flow: &FlowSpec,
    offset_units: u16,
    more_frags: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut chain = Vec::new();
    let mut types: Vec<u8> = flow.extensions.iter().map(|(t, _)| *t).collect();
    types.push(IPV6_NEXT_FRAGMENT);
    for (i, (_, len)) in flow.extensions.iter().enumerate() {
        let size = (*len as usize + 1) * 8;
        let mut ext = vec![0u8; size];
        ext[0] = types[i + 1];
        ext[1] = *len;
        chain.extend_from_slice(&ext);
    }
    chain.push(flow.protocol);
    chain.push(0);
    let flags = (offset_units << 3) | if more_frags { IPV6_MORE_FRAGMENTS } else { 0 };
    chain.extend_from_slice(&flags.to_be_bytes());
    chain.extend_from_slice(&flow.ident.to_be_bytes());

    let mut frame = ethernet(flow, ETHERTYPE_IPV6);
    let ip = ipv6_header(flow, types[0], chain.len() + payload.len());
    frame.extend_from_slice(ip.as_bytes());
    frame.extend_from_slice(&chain);
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv6_plain(flow: &FlowSpec, payload: &[u8]) -> Vec<u8> {
    let mut frame = ethernet(flow, ETHERTYPE_IPV6);
    let ip = ipv6_header(flow, flow.protocol, payload.len());
    frame.extend_from_slice(ip.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A pooled element as the collector would receive it, marked with its offset.
pub fn element(
    pool: &ElementPool,
    flow: &FlowSpec,
    offset_units: u16,
    more_frags: bool,
    payload: &[u8],
) -> Box<FragmentElement> {
    let mut elem = pool.acquire();
    elem.group_id = flow.group_id();
    elem.frag_type = flow.frag_type();
    elem.mark = offset_units as u64;
    elem.ip_protocol = flow.protocol;
    elem.frag_offset = offset_units;
    elem.more_frags = more_frags;
    elem.identification = flow.ident;
    elem.terminal = (!more_frags).then(|| flow.snapshot());
    elem.payload.extend_from_slice(payload);
    elem
}

pub fn full_packet(mark: u64) -> FullPacket {
    let flow = FlowSpec::v4(mark as u32);
    let frame = ipv4_fragment(&flow, 0, false, &[0u8; 8]);
    let view = PacketView::parse(&frame).unwrap();
    FullPacket {
        mark,
        group_id: flow.group_id(),
        data: Bytes::from(frame),
        view,
    }
}

/// Splits `payload` into fragment frames of at most `chunk` bytes, `chunk` a multiple of 8.
/// Returns them in offset order.
pub fn fragments(flow: &FlowSpec, payload: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    assert_eq!(chunk % FRAGMENT_OFFSET_UNIT, 0);
    let pieces: Vec<&[u8]> = payload.chunks(chunk).collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            let offset_units = (i * chunk / FRAGMENT_OFFSET_UNIT) as u16;
            flow.fragment(offset_units, i != last, piece)
        })
        .collect()
}

/// Deterministic payload bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
