// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

/// A region is a contiguous half-open key range `[start_key, end_key)`
/// replicated by one raft group. An empty `end_key` means "up to the end of
/// the key space".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

impl Region {
    /// A region is initialized once a snapshot or a split has installed its
    /// peer list.
    pub fn is_initialized(&self) -> bool {
        !self.peers.is_empty()
    }
}

/// `version` advances on split, `conf_ver` on membership change. Both are
/// monotonically non-decreasing for any region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// One replica of a region on one store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: u64,
    pub address: String,
    pub state: StoreState,
}
