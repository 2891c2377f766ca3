//! On-disk key namespaces.
//!
//! Every key stored in a shard's LSM carries a one-byte kind prefix.
//! System keys (`0x00`) hold state-machine bookkeeping; user keys
//! (`0x01`) additionally carry a one-byte schema version so the user
//! namespace can evolve without rewriting data. The two namespaces are
//! disjoint and user-key iteration never observes system keys.

use anyhow::ensure;

pub const KIND_SYSTEM: u8 = 0x00;
pub const KIND_USER: u8 = 0x01;
/// Current user-key schema version.
pub const VERSION_LATEST: u8 = 0x01;

/// Highest applied log index, u64 little-endian.
pub const SYS_LOCAL_INDEX: [u8; 6] = [KIND_SYSTEM, b'i', b'n', b'd', b'e', b'x'];
/// Last observed upstream leader index, u64 little-endian.
pub const SYS_LEADER_INDEX: [u8; 7] = [KIND_SYSTEM, b'l', b'e', b'a', b'd', b'e', b'r'];

/// Inclusive lower bound of the latest-version user keyspace.
pub const USER_KEY_MIN: [u8; 2] = [KIND_USER, VERSION_LATEST];
/// Exclusive upper bound of the latest-version user keyspace.
pub const USER_KEY_UPPER_BOUND: [u8; 2] = [KIND_USER, VERSION_LATEST + 1];

/// Range-end wildcard: addresses everything from the start key to the
/// end of the user keyspace.
pub const WILDCARD: [u8; 1] = [0xff];

pub fn is_wildcard(range_end: &[u8]) -> bool {
    range_end == WILDCARD
}

/// Encode `key` into `buf` as a latest-version user key. The buffer is
/// reset first so it can be reused across batch items.
pub fn encode_user_key(buf: &mut Vec<u8>, key: &[u8]) {
    buf.clear();
    buf.reserve(2 + key.len());
    buf.push(KIND_USER);
    buf.push(VERSION_LATEST);
    buf.extend_from_slice(key);
}

/// Owned-variant of [`encode_user_key`].
pub fn user_key(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_user_key(&mut buf, key);
    buf
}

/// Strip the namespace prefix from a stored user key.
pub fn decode_user_key(stored: &[u8]) -> anyhow::Result<&[u8]> {
    ensure!(stored.len() >= 2, "stored key too short");
    ensure!(stored[0] == KIND_USER, "not a user key");
    ensure!(stored[1] == VERSION_LATEST, "unknown user key version");
    Ok(&stored[2..])
}

pub fn is_user_key(stored: &[u8]) -> bool {
    stored.len() >= 2 && stored[0] == KIND_USER && stored[1] == VERSION_LATEST
}
