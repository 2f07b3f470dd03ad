//! Common constants used mostly by the `defrag` module
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const ETH_HEADER_SIZE: usize = 14;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const IPV6_FRAGMENT_HEADER_SIZE: usize = 8;
pub const ETH_IPV4_HEADER_SIZE: usize = ETH_HEADER_SIZE + IPV4_HEADER_SIZE;
pub const ETH_IPV6_HEADER_SIZE: usize = ETH_HEADER_SIZE + IPV6_HEADER_SIZE;

/// Fragment offsets are carried in units of eight octets.
pub const FRAGMENT_OFFSET_UNIT: usize = 8;

pub const IPV4_MORE_FRAGMENTS: u16 = 0x2000;
pub const IPV4_OFFSET_MASK: u16 = 0x1FFF;
pub const IPV6_MORE_FRAGMENTS: u16 = 0x0001;

pub const IPV6_NEXT_HOP_BY_HOP: u8 = 0;
pub const IPV6_NEXT_ROUTING: u8 = 43;
pub const IPV6_NEXT_FRAGMENT: u8 = 44;
pub const IPV6_NEXT_DEST_OPTIONS: u8 = 60;

pub const DEFAULT_IPV4_TTL: u8 = 64;
pub const DEFAULT_IPV6_HOP_LIMIT: u8 = 63;

/// Largest IP datagram either protocol can describe in its length field.
pub const MAX_IP_PAYLOAD: usize = u16::MAX as usize;

/// Upper bound on distinct shard labels seeded by `metrics::init_metrics`.
pub const MAX_SEEDED_SHARDS: usize = 64;
