// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Key-space layout shared by the two engines.
//!
//! Store-local metadata lives under the `0x01` local prefix so it can never
//! collide with user data, which is rewritten under the `z` prefix. The
//! raft engine holds per-region log entries and raft state; the kv engine
//! holds apply state, region-local state, and the `z`-space data itself.
//!
//! ```text
//! 0x01 0x01                       store ident
//! 0x01 0x02                      prepare-bootstrap marker
//! 0x01 0x03 <rid> 0x01 <index>    raft log entry        (raft engine)
//! 0x01 0x03 <rid> 0x02            raft local state      (raft engine)
//! 0x01 0x03 <rid> 0x03            raft apply state      (kv engine)
//! 0x01 0x04 <rid> 0x01            region local state    (kv engine)
//! z<key>                          user data             (kv engine)
//! ```

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use kestrel_proto::metapb::Region;

pub const MIN_KEY: &[u8] = &[];
pub const MAX_KEY: &[u8] = &[0xFF];

const LOCAL_PREFIX: u8 = 0x01;

pub const STORE_IDENT_KEY: &[u8] = &[LOCAL_PREFIX, 0x01];
pub const PREPARE_BOOTSTRAP_KEY: &[u8] = &[LOCAL_PREFIX, 0x02];

const REGION_RAFT_PREFIX: u8 = 0x03;
const REGION_META_PREFIX: u8 = 0x04;

const RAFT_LOG_SUFFIX: u8 = 0x01;
const RAFT_STATE_SUFFIX: u8 = 0x02;
const APPLY_STATE_SUFFIX: u8 = 0x03;

const REGION_STATE_SUFFIX: u8 = 0x01;

pub const REGION_META_MIN_KEY: &[u8] = &[LOCAL_PREFIX, REGION_META_PREFIX];
pub const REGION_META_MAX_KEY: &[u8] = &[LOCAL_PREFIX, REGION_META_PREFIX + 1];

pub const DATA_PREFIX: u8 = b'z';
pub const DATA_MIN_KEY: &[u8] = &[DATA_PREFIX];
pub const DATA_MAX_KEY: &[u8] = &[DATA_PREFIX + 1];

fn make_region_key(region_id: u64, prefix: u8, suffix: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.push(LOCAL_PREFIX);
    key.push(prefix);
    key.write_u64::<BigEndian>(region_id).unwrap();
    key.push(suffix);
    key
}

pub fn region_raft_prefix(region_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.push(LOCAL_PREFIX);
    key.push(REGION_RAFT_PREFIX);
    key.write_u64::<BigEndian>(region_id).unwrap();
    key
}

pub fn raft_log_key(region_id: u64, log_index: u64) -> Vec<u8> {
    let mut key = make_region_key(region_id, REGION_RAFT_PREFIX, RAFT_LOG_SUFFIX);
    key.write_u64::<BigEndian>(log_index).unwrap();
    key
}

/// `[raft_log_key(rid, 0), raft_log_key(rid, u64::MAX)]` bounds for range
/// deletes of a region's whole log.
pub fn raft_log_prefix(region_id: u64) -> Vec<u8> {
    make_region_key(region_id, REGION_RAFT_PREFIX, RAFT_LOG_SUFFIX)
}

pub fn raft_state_key(region_id: u64) -> Vec<u8> {
    make_region_key(region_id, REGION_RAFT_PREFIX, RAFT_STATE_SUFFIX)
}

pub fn apply_state_key(region_id: u64) -> Vec<u8> {
    make_region_key(region_id, REGION_RAFT_PREFIX, APPLY_STATE_SUFFIX)
}

pub fn region_state_key(region_id: u64) -> Vec<u8> {
    make_region_key(region_id, REGION_META_PREFIX, REGION_STATE_SUFFIX)
}

/// Extracts the region id from a region meta key produced by
/// [`region_state_key`].
pub fn decode_region_meta_key(key: &[u8]) -> Option<u64> {
    if key.len() != 11 || key[0] != LOCAL_PREFIX || key[1] != REGION_META_PREFIX {
        return None;
    }
    if key[10] != REGION_STATE_SUFFIX {
        return None;
    }
    Some(BigEndian::read_u64(&key[2..10]))
}

pub fn raft_log_index(key: &[u8]) -> Option<u64> {
    if key.len() != 19 || key[0] != LOCAL_PREFIX || key[1] != REGION_RAFT_PREFIX {
        return None;
    }
    if key[10] != RAFT_LOG_SUFFIX {
        return None;
    }
    Some(BigEndian::read_u64(&key[11..19]))
}

pub fn data_key(key: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(key.len() + 1);
    v.push(DATA_PREFIX);
    v.extend_from_slice(key);
    v
}

pub fn origin_key(key: &[u8]) -> &[u8] {
    assert!(
        validate_data_key(key),
        "invalid data key {:?}",
        key
    );
    &key[1..]
}

pub fn validate_data_key(key: &[u8]) -> bool {
    key.first() == Some(&DATA_PREFIX)
}

/// Start key of a region in the data key space.
pub fn enc_start_key(region: &Region) -> Vec<u8> {
    data_key(&region.start_key)
}

/// End key of a region in the data key space. The empty end key maps past
/// the whole data range, which keeps end keys totally ordered and usable as
/// range-tree keys.
pub fn enc_end_key(region: &Region) -> Vec<u8> {
    if region.end_key.is_empty() {
        DATA_MAX_KEY.to_vec()
    } else {
        data_key(&region.end_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_keys_ordered_by_index() {
        let a = raft_log_key(1, 1);
        let b = raft_log_key(1, 2);
        let c = raft_log_key(1, 0x0101);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(raft_log_index(&a), Some(1));
        assert_eq!(raft_log_index(&c), Some(0x0101));
        assert_eq!(raft_log_index(&raft_state_key(1)), None);
    }

    #[test]
    fn test_region_meta_key_round_trip() {
        let key = region_state_key(0xdead_beef);
        assert_eq!(decode_region_meta_key(&key), Some(0xdead_beef));
        assert!(key.as_slice() >= REGION_META_MIN_KEY);
        assert!(key.as_slice() < REGION_META_MAX_KEY);
        assert_eq!(decode_region_meta_key(STORE_IDENT_KEY), None);
    }

    #[test]
    fn test_data_key() {
        let k = data_key(b"abc");
        assert!(validate_data_key(&k));
        assert_eq!(origin_key(&k), b"abc");

        let mut region = Region::default();
        region.start_key = b"a".to_vec();
        assert_eq!(enc_start_key(&region), data_key(b"a"));
        assert_eq!(enc_end_key(&region), DATA_MAX_KEY.to_vec());
        region.end_key = b"z".to_vec();
        assert_eq!(enc_end_key(&region), data_key(b"z"));
        assert!(enc_end_key(&region) < DATA_MAX_KEY.to_vec());
    }
}
