// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Per-protocol detection and reassembly.
//!
//! Each [`FragmentType`] maps onto one static handler. Handlers parse headers in place,
//! decide group membership and rebuild a single unfragmented frame once a group is complete.
use bytes::Bytes;
use macaddr::MacAddr6;
use std::net::IpAddr;
use zerocopy::{FromBytes, IntoBytes};

use crate::constants::*;
use crate::defrag::element::FragmentElement;
use crate::defrag::group::{FragmentGroup, Insertion};
use crate::defrag::layers::SharedLayers;
use crate::defrag::protocol::{
    DetectionInfo, FragmentType, HeaderSnapshot, Ipv4Header, Ipv6FragmentHeader, Ipv6Header,
    PacketView,
};
use crate::errors::{DetectError, ReassembleError};

/// Frame bytes and parsed view produced by a successful reassembly.
#[derive(Debug, Clone)]
pub struct Reassembled {
    pub data: Bytes,
    pub view: PacketView,
}

pub trait FragmentHandler: Send + Sync {
    fn fragment_type(&self) -> FragmentType;

    /// Parses the network layer of `eth_payload`. Leaves `info.frag_type` unset when the
    /// datagram is not fragmented.
    fn fast_detect<'a>(
        &self,
        eth_payload: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> Result<(), DetectError>;

    fn collect(&self, element: Box<FragmentElement>, group: &mut FragmentGroup) -> Insertion {
        group.insert(element)
    }

    fn reassemble(
        &self,
        group: &FragmentGroup,
        layers: &mut SharedLayers,
    ) -> Result<Reassembled, ReassembleError>;
}

static IPV4_HANDLER: Ipv4Handler = Ipv4Handler;
static IPV6_HANDLER: Ipv6Handler = Ipv6Handler;

impl FragmentType {
    pub fn handler(self) -> &'static dyn FragmentHandler {
        match self {
            FragmentType::Ipv4 => &IPV4_HANDLER,
            FragmentType::Ipv6 => &IPV6_HANDLER,
        }
    }
}

fn mac_of(bytes: [u8; 6]) -> MacAddr6 {
    MacAddr6::from(bytes)
}

fn mac_bytes(mac: &MacAddr6) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(mac.as_bytes());
    out
}

fn terminal_snapshot(group: &FragmentGroup) -> Result<HeaderSnapshot, ReassembleError> {
    group
        .terminal()
        .copied()
        .ok_or_else(|| ReassembleError::MissingTerminal(group.id().to_string()))
}

/// Serializes `headers` followed by every element payload into `scratch`, then copies the
/// frame out so the scratch buffer can be reused.
fn write_frame(
    scratch: &mut Vec<u8>,
    headers: &[&[u8]],
    group: &FragmentGroup,
) -> Result<Reassembled, ReassembleError> {
    scratch.clear();
    let header_len: usize = headers.iter().map(|h| h.len()).sum();
    scratch.try_reserve(header_len + group.current_total_len())?;
    for header in headers {
        scratch.extend_from_slice(header);
    }

    let mut expected = 0;
    for elem in group.elements() {
        if elem.byte_offset() != expected {
            return Err(ReassembleError::InconsistentLayout {
                expected,
                found: elem.byte_offset(),
            });
        }
        scratch.extend_from_slice(&elem.payload);
        expected += elem.len();
    }

    let data = Bytes::copy_from_slice(scratch);
    let view = PacketView::parse(&data).map_err(ReassembleError::Reparse)?;
    Ok(Reassembled { data, view })
}

#[derive(Debug, Default)]
pub struct Ipv4Handler;

impl FragmentHandler for Ipv4Handler {
    fn fragment_type(&self) -> FragmentType {
        FragmentType::Ipv4
    }

    fn fast_detect<'a>(
        &self,
        buf: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> Result<(), DetectError> {
        if buf.len() <= IPV4_HEADER_SIZE {
            return Err(DetectError::Ipv4HeaderTooShort {
                needed: IPV4_HEADER_SIZE + 1,
                available: buf.len(),
            });
        }
        let (ip, _) = Ipv4Header::ref_from_prefix(buf).map_err(|_| DetectError::Ipv4HeaderTooShort {
            needed: IPV4_HEADER_SIZE,
            available: buf.len(),
        })?;
        if ip.version() != 4 {
            return Err(DetectError::NetworkLayerMismatch {
                expected: 4,
                found: ip.version(),
            });
        }
        if !ip.more_fragments() && ip.fragment_offset() == 0 {
            return Ok(());
        }

        let header_len = ip.header_length();
        let total_len = ip.total_length.get() as usize;
        if header_len < IPV4_HEADER_SIZE || total_len < header_len || total_len > buf.len() {
            return Err(DetectError::Ipv4HeaderTooShort {
                needed: total_len.max(header_len).max(IPV4_HEADER_SIZE),
                available: buf.len(),
            });
        }

        let src = IpAddr::V4(ip.src());
        let dst = IpAddr::V4(ip.dst());
        info.frag_type = Some(FragmentType::Ipv4);
        info.src_ip = Some(src);
        info.dst_ip = Some(dst);
        info.ip_protocol = ip.protocol;
        info.frag_offset = ip.fragment_offset();
        info.more_frags = ip.more_fragments();
        info.identification = ip.identification.get() as u32;
        info.ip_payload = &buf[header_len..total_len];
        info.terminal = None;
        if !info.more_frags {
            let (src_mac, dst_mac) = info
                .link
                .map(|eth| (mac_of(eth.src_mac), mac_of(eth.dst_mac)))
                .unwrap_or((MacAddr6::nil(), MacAddr6::nil()));
            info.terminal = Some(HeaderSnapshot {
                src_mac,
                dst_mac,
                src_ip: src,
                dst_ip: dst,
                next_protocol: ip.protocol,
                traffic_class: ip.tos,
                hop_limit: ip.ttl,
                flow_label: 0,
                identification: info.identification,
            });
        }
        Ok(())
    }

    fn reassemble(
        &self,
        group: &FragmentGroup,
        layers: &mut SharedLayers,
    ) -> Result<Reassembled, ReassembleError> {
        let snap = terminal_snapshot(group)?;
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (snap.src_ip, snap.dst_ip) else {
            return Err(ReassembleError::HeaderSerialize(format!(
                "group {} has non-IPv4 addresses",
                group.id()
            )));
        };
        let total_len = IPV4_HEADER_SIZE + group.current_total_len();
        if total_len > MAX_IP_PAYLOAD {
            return Err(ReassembleError::HeaderSerialize(format!(
                "IPv4 total length {total_len} exceeds {MAX_IP_PAYLOAD}"
            )));
        }

        let SharedLayers {
            eth, ipv4, scratch, ..
        } = layers;
        eth.dst_mac = mac_bytes(&snap.dst_mac);
        eth.src_mac = mac_bytes(&snap.src_mac);
        eth.ether_type.set(ETHERTYPE_IPV4);

        ipv4.version_ihl = 0x45;
        ipv4.tos = snap.traffic_class;
        ipv4.total_length.set(total_len as u16);
        ipv4.identification.set(snap.identification as u16);
        ipv4.flags_fragment.set(0);
        ipv4.ttl = snap.hop_limit;
        ipv4.protocol = group.next_protocol().unwrap_or(snap.next_protocol);
        ipv4.src_addr = src.octets();
        ipv4.dst_addr = dst.octets();
        ipv4.update_checksum();

        write_frame(scratch, &[eth.as_bytes(), ipv4.as_bytes()], group)
    }
}

#[derive(Debug, Default)]
pub struct Ipv6Handler;

impl Ipv6Handler {
    /// Skips hop-by-hop, routing and destination-options headers. Returns the bytes that
    /// start at the fragment header, or `None` when the chain ends without one.
    fn find_fragment_header(
        mut next: u8,
        mut rest: &[u8],
        available: usize,
    ) -> Result<Option<&[u8]>, DetectError> {
        loop {
            match next {
                IPV6_NEXT_FRAGMENT => return Ok(Some(rest)),
                IPV6_NEXT_HOP_BY_HOP | IPV6_NEXT_ROUTING | IPV6_NEXT_DEST_OPTIONS => {
                    if rest.len() < 2 {
                        return Err(DetectError::Ipv6HeaderTooShort {
                            needed: available - rest.len() + 2,
                            available,
                        });
                    }
                    let ext_len = (rest[1] as usize + 1) * 8;
                    if rest.len() < ext_len {
                        return Err(DetectError::Ipv6HeaderTooShort {
                            needed: available - rest.len() + ext_len,
                            available,
                        });
                    }
                    next = rest[0];
                    rest = &rest[ext_len..];
                }
                _ => return Ok(None),
            }
        }
    }
}

impl FragmentHandler for Ipv6Handler {
    fn fragment_type(&self) -> FragmentType {
        FragmentType::Ipv6
    }

    fn fast_detect<'a>(
        &self,
        buf: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> Result<(), DetectError> {
        if buf.len() <= IPV6_HEADER_SIZE {
            return Err(DetectError::Ipv6HeaderTooShort {
                needed: IPV6_HEADER_SIZE + 1,
                available: buf.len(),
            });
        }
        let (ip, rest) = Ipv6Header::ref_from_prefix(buf).map_err(|_| DetectError::Ipv6HeaderTooShort {
            needed: IPV6_HEADER_SIZE,
            available: buf.len(),
        })?;
        if ip.version() != 6 {
            return Err(DetectError::NetworkLayerMismatch {
                expected: 6,
                found: ip.version(),
            });
        }
        let payload_len = ip.payload_length.get() as usize;
        if payload_len > rest.len() {
            return Err(DetectError::Ipv6HeaderTooShort {
                needed: IPV6_HEADER_SIZE + payload_len,
                available: buf.len(),
            });
        }
        let rest = &rest[..payload_len];

        let Some(frag_bytes) = Self::find_fragment_header(ip.next_header, rest, buf.len())? else {
            return Ok(());
        };
        if frag_bytes.len() <= IPV6_FRAGMENT_HEADER_SIZE {
            return Err(DetectError::Ipv6FragmentHeaderTooShort {
                needed: IPV6_FRAGMENT_HEADER_SIZE + 1,
                available: frag_bytes.len(),
            });
        }
        let (frag, payload) = Ipv6FragmentHeader::ref_from_prefix(frag_bytes).map_err(|_| {
            DetectError::Ipv6FragmentHeaderTooShort {
                needed: IPV6_FRAGMENT_HEADER_SIZE,
                available: frag_bytes.len(),
            }
        })?;
        if !frag.more_fragments() && frag.fragment_offset() == 0 {
            return Ok(());
        }

        let src = IpAddr::V6(ip.src());
        let dst = IpAddr::V6(ip.dst());
        info.frag_type = Some(FragmentType::Ipv6);
        info.src_ip = Some(src);
        info.dst_ip = Some(dst);
        info.ip_protocol = frag.next_header;
        info.frag_offset = frag.fragment_offset();
        info.more_frags = frag.more_fragments();
        info.identification = frag.identification.get();
        info.ip_payload = payload;
        info.terminal = None;
        if !info.more_frags {
            let (src_mac, dst_mac) = info
                .link
                .map(|eth| (mac_of(eth.src_mac), mac_of(eth.dst_mac)))
                .unwrap_or((MacAddr6::nil(), MacAddr6::nil()));
            info.terminal = Some(HeaderSnapshot {
                src_mac,
                dst_mac,
                src_ip: src,
                dst_ip: dst,
                next_protocol: frag.next_header,
                traffic_class: ip.traffic_class(),
                hop_limit: ip.hop_limit,
                flow_label: ip.flow_label(),
                identification: info.identification,
            });
        }
        Ok(())
    }

    fn reassemble(
        &self,
        group: &FragmentGroup,
        layers: &mut SharedLayers,
    ) -> Result<Reassembled, ReassembleError> {
        let snap = terminal_snapshot(group)?;
        let (IpAddr::V6(src), IpAddr::V6(dst)) = (snap.src_ip, snap.dst_ip) else {
            return Err(ReassembleError::HeaderSerialize(format!(
                "group {} has non-IPv6 addresses",
                group.id()
            )));
        };
        let payload_len = group.current_total_len();
        if payload_len > MAX_IP_PAYLOAD {
            return Err(ReassembleError::HeaderSerialize(format!(
                "IPv6 payload length {payload_len} exceeds {MAX_IP_PAYLOAD}"
            )));
        }

        let SharedLayers {
            eth, ipv6, scratch, ..
        } = layers;
        eth.dst_mac = mac_bytes(&snap.dst_mac);
        eth.src_mac = mac_bytes(&snap.src_mac);
        eth.ether_type.set(ETHERTYPE_IPV6);

        ipv6.set_version_traffic_flow(snap.traffic_class, snap.flow_label);
        ipv6.payload_length.set(payload_len as u16);
        ipv6.next_header = group.next_protocol().unwrap_or(snap.next_protocol);
        ipv6.hop_limit = snap.hop_limit;
        ipv6.src_addr = src.octets();
        ipv6.dst_addr = dst.octets();

        write_frame(scratch, &[eth.as_bytes(), ipv6.as_bytes()], group)
    }
}
