// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use crate::{errorpb, metapb};

/// Context every command carries so the store can validate it landed on the
/// right peer in the right epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftRequestHeader {
    pub region_id: u64,
    pub peer: metapb::Peer,
    pub region_epoch: metapb::RegionEpoch,
    /// Term the client observed; 0 means "don't check".
    pub term: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get { cf: String, key: Vec<u8> },
    Put { cf: String, key: Vec<u8>, value: Vec<u8> },
    Delete { cf: String, key: Vec<u8> },
    /// Capture a region-scoped engine snapshot for scanning.
    Snap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Vec<u8>> },
    Put,
    Delete,
    Snap { region: metapb::Region },
}

/// Mirror of the raft conf-change kinds that can travel inside a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

impl From<ConfChangeKind> for raft::eraftpb::ConfChangeType {
    fn from(kind: ConfChangeKind) -> raft::eraftpb::ConfChangeType {
        match kind {
            ConfChangeKind::AddNode => raft::eraftpb::ConfChangeType::AddNode,
            ConfChangeKind::RemoveNode => raft::eraftpb::ConfChangeType::RemoveNode,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangePeerRequest {
    pub change_type: ConfChangeKind,
    pub peer: metapb::Peer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactLogRequest {
    pub compact_index: u64,
    pub compact_term: u64,
}

/// One new region carved out of the parent. The parent keeps its own id and
/// its start key; every split key starts a new region to the right.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub split_key: Vec<u8>,
    pub new_region_id: u64,
    /// New peer ids, positionally matching the parent's peer list.
    pub new_peer_ids: Vec<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSplitRequest {
    pub requests: Vec<SplitRequest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferLeaderRequest {
    pub peer: metapb::Peer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AdminRequest {
    ChangePeer(ChangePeerRequest),
    CompactLog(CompactLogRequest),
    Splits(BatchSplitRequest),
    TransferLeader(TransferLeaderRequest),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCmdType {
    ChangePeer,
    CompactLog,
    BatchSplit,
    TransferLeader,
}

impl AdminRequest {
    pub fn cmd_type(&self) -> AdminCmdType {
        match self {
            AdminRequest::ChangePeer(_) => AdminCmdType::ChangePeer,
            AdminRequest::CompactLog(_) => AdminCmdType::CompactLog,
            AdminRequest::Splits(_) => AdminCmdType::BatchSplit,
            AdminRequest::TransferLeader(_) => AdminCmdType::TransferLeader,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AdminResponse {
    ChangePeer { region: metapb::Region },
    CompactLog,
    Splits { regions: Vec<metapb::Region> },
    TransferLeader,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftCmdRequest {
    pub header: RaftRequestHeader,
    pub requests: Vec<Request>,
    pub admin_request: Option<AdminRequest>,
}

impl RaftCmdRequest {
    pub fn has_admin_request(&self) -> bool {
        self.admin_request.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftResponseHeader {
    pub error: Option<errorpb::Error>,
    pub current_term: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftCmdResponse {
    pub header: RaftResponseHeader,
    pub responses: Vec<Response>,
    pub admin_response: Option<AdminResponse>,
}
