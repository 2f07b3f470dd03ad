//! Misc. helper functions
use std::hash::{DefaultHasher, Hash, Hasher};

/// Computes the RFC 1071 internet checksum of `data`.
///
/// Returns the one's complement of the folded sum, so running it over a header whose
/// checksum field is already filled in yields zero when the header is intact.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Maps a key onto one of `shards` partitions.
///
/// `DefaultHasher::new()` uses fixed keys, so a given key always lands on the same shard
/// for the lifetime of the process.
pub fn shard_index<K: Hash + ?Sized>(key: &K, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
