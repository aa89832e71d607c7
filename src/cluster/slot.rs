//! Key → hash-slot mapping.
//!
//! Cluster keyspace placement uses CRC16/XMODEM over the key's hash tag,
//! reduced to a 14-bit slot. A hash tag is the substring between the first
//! `{` and the next `}`; when present and non-empty it alone feeds the
//! hash, which lets callers colocate related keys (a list and its timeout
//! marker) on one node.

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC16/XMODEM (poly 0x1021, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// The portion of `key` that feeds the slot hash.
///
/// Returns the content of the first `{...}` pair when it is non-empty,
/// otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// The hash slot for `key`.
pub fn slot(key: &str) -> u16 {
    crc16(hash_tag(key.as_bytes())) % SLOT_COUNT
}
