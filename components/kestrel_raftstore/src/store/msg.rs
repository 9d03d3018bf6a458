// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::time::Instant;

use kestrel_engine::KvEngine;
use kestrel_proto::metapb::{self, RegionEpoch};
use kestrel_proto::raft_cmdpb::{RaftCmdRequest, RaftCmdResponse};
use kestrel_proto::raft_serverpb::RaftMessage;

use crate::store::fsm::apply::TaskRes as ApplyTaskRes;
use crate::store::util::KeysInfoFormatter;
use crate::store::{RegionSnapshot, SnapKey};

#[derive(Debug)]
pub struct ReadResponse<E: KvEngine> {
    pub response: RaftCmdResponse,
    pub snapshot: Option<RegionSnapshot<E::Snapshot>>,
}

#[derive(Debug)]
pub struct WriteResponse {
    pub response: RaftCmdResponse,
}

pub type ReadCallback<E> = Box<dyn FnOnce(ReadResponse<E>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(WriteResponse) + Send>;

/// Single-shot completion handle for a client proposal. The pending
/// proposal queue owns it until the matching log index applies or the
/// proposal is superseded; either way it fires exactly once.
///  - `Read`: for read-only requests (`Get` and `Snap`), may carry a
///    region-scoped engine snapshot.
///  - `Write`: for mutations and admin commands.
pub enum Callback<E: KvEngine> {
    /// No callback.
    None,
    Read(ReadCallback<E>),
    Write(WriteCallback),
}

impl<E: KvEngine> Callback<E> {
    pub fn invoke_with_response(self, resp: RaftCmdResponse) {
        match self {
            Callback::None => (),
            Callback::Read(read) => {
                read(ReadResponse {
                    response: resp,
                    snapshot: None,
                });
            }
            Callback::Write(write) => {
                write(WriteResponse { response: resp });
            }
        }
    }

    pub fn invoke_read(self, args: ReadResponse<E>) {
        match self {
            Callback::Read(read) => read(args),
            other => panic!("expect Callback::Read(..), got {:?}", other),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Callback::None)
    }
}

impl<E: KvEngine> fmt::Debug for Callback<E> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::None => write!(fmt, "Callback::None"),
            Callback::Read(_) => write!(fmt, "Callback::Read(..)"),
            Callback::Write(_) => write!(fmt, "Callback::Write(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTick {
    Raft = 0,
    RaftLogGc = 1,
    SplitRegionCheck = 2,
    PdHeartbeat = 3,
}

pub const PEER_TICK_COUNT: usize = 4;

impl PeerTick {
    #[inline]
    pub fn tag(self) -> &'static str {
        match self {
            PeerTick::Raft => "raft",
            PeerTick::RaftLogGc => "raft_log_gc",
            PeerTick::SplitRegionCheck => "split_region_check",
            PeerTick::PdHeartbeat => "pd_heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTick {
    SnapGc = 0,
    PdStoreHeartbeat = 1,
}

pub const STORE_TICK_COUNT: usize = 2;

impl StoreTick {
    #[inline]
    pub fn tag(self) -> &'static str {
        match self {
            StoreTick::SnapGc => "snap_gc",
            StoreTick::PdStoreHeartbeat => "pd_store_heartbeat",
        }
    }
}

/// Raft command expected to be proposed by the leader of the target raft
/// group.
#[derive(Debug)]
pub struct RaftCommand<E: KvEngine> {
    pub send_time: Instant,
    pub request: RaftCmdRequest,
    pub callback: Callback<E>,
}

impl<E: KvEngine> RaftCommand<E> {
    #[inline]
    pub fn new(request: RaftCmdRequest, callback: Callback<E>) -> RaftCommand<E> {
        RaftCommand {
            request,
            callback,
            send_time: Instant::now(),
        }
    }
}

/// Message that can be sent to a peer.
pub enum PeerMsg<E: KvEngine> {
    /// Raft message between peers of one raft group. Messages targeting a
    /// peer that doesn't exist are redirected to the store mailbox.
    RaftMessage(RaftMessage),
    /// Client proposal. If it can't be delivered the callback must be
    /// invoked before dropping, or the client would hang.
    RaftCommand(RaftCommand<E>),
    /// Periodical task driven by the tick driver.
    Tick,
    /// Result of applying committed entries. Can't be lost.
    ApplyRes(ApplyTaskRes),
    /// Ask the placement driver to split this region at the given keys.
    SplitRegion {
        region_epoch: RegionEpoch,
        split_keys: Vec<Vec<u8>>,
        callback: Callback<E>,
    },
    /// Updated size estimate from the split-check worker.
    ApproximateRegionSize(u64),
    /// Remove stale snapshot files in `snaps`; the flag marks sending
    /// snapshots.
    GcSnap { snaps: Vec<(SnapKey, bool)> },
    /// Start the peer: initialize its ticker and schedule initial events.
    Start,
}

impl<E: KvEngine> fmt::Debug for PeerMsg<E> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMsg::RaftMessage(_) => write!(fmt, "Raft Message"),
            PeerMsg::RaftCommand(_) => write!(fmt, "Raft Command"),
            PeerMsg::Tick => write!(fmt, "Tick"),
            PeerMsg::ApplyRes(res) => write!(fmt, "ApplyRes {:?}", res),
            PeerMsg::SplitRegion { split_keys, .. } => write!(
                fmt,
                "Split region with {}",
                KeysInfoFormatter(split_keys.iter())
            ),
            PeerMsg::ApproximateRegionSize(size) => {
                write!(fmt, "Region's approximate size [size: {}]", size)
            }
            PeerMsg::GcSnap { snaps } => write!(fmt, "gc snaps {:?}", snaps),
            PeerMsg::Start => write!(fmt, "Startup"),
        }
    }
}

pub enum StoreMsg {
    /// Raft message whose target peer doesn't exist yet; the store may
    /// create it.
    RaftMessage(RaftMessage),
    Tick,
    Start { store: metapb::Store },
}

impl fmt::Debug for StoreMsg {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMsg::RaftMessage(_) => write!(fmt, "Raft Message"),
            StoreMsg::Tick => write!(fmt, "StoreTick"),
            StoreMsg::Start { store } => write!(fmt, "Start store {:?}", store),
        }
    }
}
