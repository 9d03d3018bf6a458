// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use raft::eraftpb;
use serde::{Deserialize, Serialize};

use crate::metapb;

/// Envelope for a raft message travelling between two peers of one region.
///
/// `region_epoch` reflects the sender's view of the region and is used by
/// the receiver to detect stale senders; a missing epoch is a protocol
/// error and the message is dropped. A tombstone envelope carries no raft
/// payload: it tells the addressed peer to garbage-collect itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RaftMessage {
    pub region_id: u64,
    pub from_peer: metapb::Peer,
    pub to_peer: metapb::Peer,
    pub region_epoch: Option<metapb::RegionEpoch>,
    pub message: eraftpb::Message,
    pub is_tombstone: bool,
    /// The sender's view of the region range, so a store receiving a
    /// message for a peer it does not host yet can judge overlaps.
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

/// Metadata embedded in `eraftpb::Snapshot::data`; the bulk key-value
/// payload lives in a snapshot file managed outside the raft log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftSnapshotData {
    pub region: metapb::Region,
    pub file_size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftTruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Raft hard state plus the position of the last log entry, persisted in
/// the raft engine under the region's raft state key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftLocalState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
    pub last_index: u64,
    pub last_term: u64,
}

impl RaftLocalState {
    pub fn hard_state(&self) -> eraftpb::HardState {
        let mut hs = eraftpb::HardState::default();
        hs.set_term(self.term);
        hs.set_vote(self.vote);
        hs.set_commit(self.commit);
        hs
    }

    pub fn set_hard_state(&mut self, hs: &eraftpb::HardState) {
        self.term = hs.get_term();
        self.vote = hs.get_vote();
        self.commit = hs.get_commit();
    }
}

/// Updated in the same write batch as the data it accounts for, so a crash
/// never observes data without the matching applied index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftApplyState {
    pub applied_index: u64,
    pub truncated_state: RaftTruncatedState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    Normal,
    Applying,
    Tombstone,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionLocalState {
    pub state: PeerState,
    pub region: metapb::Region,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreIdent {
    pub cluster_id: u64,
    pub store_id: u64,
}
