// SPDX-License-Identifier: BSD-3-Clause-LBNL
use bytes::Bytes;
use macaddr::MacAddr6;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use zerocopy::{byteorder::*, *};
use zerocopy_derive::*;

use crate::constants::*;
use crate::util::internet_checksum;

/// Ethernet Frame Header
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct EthernetHeader {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ether_type: U16<NetworkEndian>,
}

/// IPv4 Header, options are not included
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: U16<NetworkEndian>,
    pub identification: U16<NetworkEndian>,
    pub flags_fragment: U16<NetworkEndian>,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16<NetworkEndian>,
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Get the header length in bytes.
    pub fn header_length(&self) -> usize {
        ((self.version_ihl & 0x0F) as usize) * 4
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_fragment.get() & IPV4_MORE_FRAGMENTS != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.flags_fragment.get() & IPV4_OFFSET_MASK
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }

    /// Recomputes the header checksum over the fixed 20 byte header.
    pub fn update_checksum(&mut self) {
        self.checksum.set(0);
        let sum = internet_checksum(self.as_bytes());
        self.checksum.set(sum);
    }
}

/// IPv6 Header
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct Ipv6Header {
    pub version_traffic_flow: U32<NetworkEndian>,
    pub payload_length: U16<NetworkEndian>,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
}

impl Ipv6Header {
    pub fn version(&self) -> u8 {
        (self.version_traffic_flow.get() >> 28) as u8
    }

    pub fn traffic_class(&self) -> u8 {
        ((self.version_traffic_flow.get() >> 20) & 0xFF) as u8
    }

    pub fn flow_label(&self) -> u32 {
        self.version_traffic_flow.get() & 0x000F_FFFF
    }

    pub fn set_version_traffic_flow(&mut self, traffic_class: u8, flow_label: u32) {
        self.version_traffic_flow
            .set((6 << 28) | ((traffic_class as u32) << 20) | (flow_label & 0x000F_FFFF));
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.src_addr)
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.dst_addr)
    }
}

/// IPv6 Fragment extension header (next header 44)
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct Ipv6FragmentHeader {
    pub next_header: u8,
    pub reserved: u8,
    pub offset_flags: U16<NetworkEndian>,
    pub identification: U32<NetworkEndian>,
}

impl Ipv6FragmentHeader {
    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.offset_flags.get() >> 3
    }

    pub fn more_fragments(&self) -> bool {
        self.offset_flags.get() & IPV6_MORE_FRAGMENTS != 0
    }
}

/// Fragment protocols the engine knows how to reassemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Ipv4,
    Ipv6,
}

impl FragmentType {
    pub const ALL: [FragmentType; 2] = [FragmentType::Ipv4, FragmentType::Ipv6];

    pub fn from_ether_type(ether_type: u16) -> Option<Self> {
        match ether_type {
            ETHERTYPE_IPV4 => Some(FragmentType::Ipv4),
            ETHERTYPE_IPV6 => Some(FragmentType::Ipv6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentType::Ipv4 => "ipv4",
            FragmentType::Ipv6 => "ipv6",
        }
    }
}

/// Numeric codes used by capture tooling: 1 is IPv4, 2 is IPv6. Everything else is invalid.
impl TryFrom<i8> for FragmentType {
    type Error = i8;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FragmentType::Ipv4),
            2 => Ok(FragmentType::Ipv6),
            other => Err(other),
        }
    }
}

impl FromStr for FragmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "ip4" | "v4" => Ok(FragmentType::Ipv4),
            "ipv6" | "ip6" | "v6" => Ok(FragmentType::Ipv6),
            other => Err(format!("unknown fragment type: {other}")),
        }
    }
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one datagram's fragments: (source, destination, protocol, identification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub identification: u32,
}

impl Default for GroupId {
    fn default() -> Self {
        GroupId {
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol: 0,
            identification: 0,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.src, self.dst, self.protocol, self.identification
        )
    }
}

impl Serialize for GroupId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Header fields retained from the terminal fragment. Every fragment of a datagram
/// carries the same addresses, so only the last one is kept for reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub src_mac: MacAddr6,
    pub dst_mac: MacAddr6,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub next_protocol: u8,
    /// IPv4 TOS or IPv6 traffic class
    pub traffic_class: u8,
    /// IPv4 TTL or IPv6 hop limit
    pub hop_limit: u8,
    pub flow_label: u32,
    pub identification: u32,
}

/// Result of inspecting one frame. Borrows the frame; nothing is copied until collection.
#[derive(Debug, Default, Clone)]
pub struct DetectionInfo<'a> {
    pub link: Option<&'a EthernetHeader>,
    pub ether_type: u16,
    pub eth_payload: &'a [u8],
    pub frag_type: Option<FragmentType>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub ip_protocol: u8,
    /// In 8-byte units.
    pub frag_offset: u16,
    pub more_frags: bool,
    pub identification: u32,
    pub ip_payload: &'a [u8],
    /// Only populated on the terminal fragment.
    pub terminal: Option<HeaderSnapshot>,
}

impl<'a> DetectionInfo<'a> {
    pub fn is_fragment(&self) -> bool {
        self.frag_type.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.is_fragment() && !self.more_frags
    }

    pub fn byte_offset(&self) -> usize {
        self.frag_offset as usize * FRAGMENT_OFFSET_UNIT
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.frag_type?;
        Some(GroupId {
            src: self.src_ip?,
            dst: self.dst_ip?,
            protocol: self.ip_protocol,
            identification: self.identification,
        })
    }

    pub fn reset(&mut self) {
        *self = DetectionInfo::default();
    }
}

/// Parsed summary of a reassembled frame.
#[derive(Debug, Clone, Serialize)]
pub struct PacketView {
    pub src_mac: String,
    pub dst_mac: String,
    pub ether_type: u16,
    pub ip_version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: u8,
    /// Offset of the transport payload within the frame.
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl PacketView {
    /// Parses a non-fragmented Ethernet + IP frame, checking every length field agrees with the buffer.
    pub fn parse(frame: &[u8]) -> Result<Self, String> {
        let (eth, rem) = EthernetHeader::ref_from_prefix(frame)
            .map_err(|_| format!("frame of {} bytes has no ethernet header", frame.len()))?;
        let src_mac = MacAddr6::from(eth.src_mac).to_string();
        let dst_mac = MacAddr6::from(eth.dst_mac).to_string();
        match eth.ether_type.get() {
            ETHERTYPE_IPV4 => {
                let (ip, _) = Ipv4Header::ref_from_prefix(rem)
                    .map_err(|_| "truncated IPv4 header".to_string())?;
                if ip.version() != 4 {
                    return Err(format!("IPv4 version field is {}", ip.version()));
                }
                let header_len = ip.header_length();
                if header_len < IPV4_HEADER_SIZE || ip.total_length.get() as usize != rem.len() {
                    return Err(format!(
                        "IPv4 total length {} does not match {} bytes",
                        ip.total_length.get(),
                        rem.len()
                    ));
                }
                if ip.more_fragments() || ip.fragment_offset() != 0 {
                    return Err("IPv4 header still marked as fragment".into());
                }
                if internet_checksum(&rem[..header_len]) != 0 {
                    return Err("IPv4 header checksum mismatch".into());
                }
                Ok(PacketView {
                    src_mac,
                    dst_mac,
                    ether_type: ETHERTYPE_IPV4,
                    ip_version: 4,
                    src_ip: IpAddr::V4(ip.src()),
                    dst_ip: IpAddr::V4(ip.dst()),
                    protocol: ip.protocol,
                    payload_offset: ETH_HEADER_SIZE + header_len,
                    payload_len: rem.len() - header_len,
                })
            }
            ETHERTYPE_IPV6 => {
                let (ip, payload) = Ipv6Header::ref_from_prefix(rem)
                    .map_err(|_| "truncated IPv6 header".to_string())?;
                if ip.version() != 6 {
                    return Err(format!("IPv6 version field is {}", ip.version()));
                }
                if ip.payload_length.get() as usize != payload.len() {
                    return Err(format!(
                        "IPv6 payload length {} does not match {} bytes",
                        ip.payload_length.get(),
                        payload.len()
                    ));
                }
                if ip.next_header == IPV6_NEXT_FRAGMENT {
                    return Err("IPv6 header still carries a fragment header".into());
                }
                Ok(PacketView {
                    src_mac,
                    dst_mac,
                    ether_type: ETHERTYPE_IPV6,
                    ip_version: 6,
                    src_ip: IpAddr::V6(ip.src()),
                    dst_ip: IpAddr::V6(ip.dst()),
                    protocol: ip.next_header,
                    payload_offset: ETH_IPV6_HEADER_SIZE,
                    payload_len: payload.len(),
                })
            }
            other => Err(format!("unexpected ethertype {other:#06x}")),
        }
    }
}

/// A reassembled datagram, ready for delivery.
#[derive(Debug, Clone)]
pub struct FullPacket {
    pub mark: u64,
    pub group_id: GroupId,
    pub data: Bytes,
    pub view: PacketView,
}

impl FullPacket {
    pub fn mark(&self) -> u64 {
        self.mark
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Transport payload of the reassembled datagram.
    pub fn payload(&self) -> &[u8] {
        let start = self.view.payload_offset.min(self.data.len());
        let end = (start + self.view.payload_len).min(self.data.len());
        &self.data[start..end]
    }

    /// Drops the reference to the frame bytes once the consumer is done with them.
    pub fn release(&mut self) {
        self.data = Bytes::new();
    }
}

/// Serializes the packet metadata, leaving the frame bytes out.
impl Serialize for FullPacket {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("FullPacket", 4)?;
        state.serialize_field("mark", &self.mark)?;
        state.serialize_field("group_id", &self.group_id)?;
        state.serialize_field("len", &self.data.len())?;
        state.serialize_field("view", &self.view)?;
        state.end()
    }
}

impl fmt::Display for FullPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "mark {} group {} len {}",
            self.mark,
            self.group_id,
            self.data.len()
        )?;
        for (i, chunk) in self.data.chunks(16).enumerate() {
            let hex_line: Vec<String> = chunk.iter().map(|byte| format!("{:02x}", byte)).collect();
            let utf8_line: String = chunk
                .iter()
                .map(|&byte| {
                    if byte.is_ascii_graphic() {
                        byte as char
                    } else {
                        '.'
                    }
                })
                .collect();
            writeln!(f, "{:08x} | {:<47} | {}", i * 16, hex_line.join(" "), utf8_line)?;
        }
        Ok(())
    }
}
