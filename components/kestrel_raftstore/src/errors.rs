// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::error;
use std::io;
use std::result;

use crossbeam::channel::TrySendError;
use kestrel_proto::{errorpb, metapb};
use protobuf::ProtobufError;
use thiserror::Error;

use crate::store::SnapError;

pub const RAFTSTORE_IS_BUSY: &str = "raftstore is busy";

/// Describes why a message is discarded.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DiscardReason {
    /// Channel is disconnected, message can't be delivered.
    Disconnected,
    /// Channel runs out of capacity, message can't be delivered.
    Full,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("raft entry is too large, region {0}, entry size {1}")]
    RaftEntryTooLarge(u64, u64),
    #[error("to store id {0}, mine {1}")]
    StoreNotMatch(u64, u64),
    #[error("region {0} not found")]
    RegionNotFound(u64),
    #[error("region {0} was removed")]
    RegionRemoved(u64),
    #[error("region {0} not initialized yet")]
    RegionNotInitialized(u64),
    #[error("peer is not leader for region {0}, leader may {1:?}")]
    NotLeader(u64, Option<metapb::Peer>),
    #[error("key {0:?} is not in region {1:?}")]
    KeyNotInRegion(Vec<u8>, metapb::Region),
    #[error("EpochNotMatch {0}")]
    EpochNotMatch(String, Vec<metapb::Region>),
    #[error("stale command")]
    StaleCommand,
    #[error("Discard due to {0:?}")]
    Transport(DiscardReason),
    #[error("{0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),

    // Following is for From other errors.
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("Engine {0}")]
    Engine(#[from] kestrel_engine::Error),
    #[error("Protobuf {0}")]
    Protobuf(#[from] ProtobufError),
    #[error("Codec {0}")]
    Codec(#[from] bincode::Error),
    #[error("Pd {0}")]
    Pd(#[from] kestrel_pd::Error),
    #[error("Raft {0}")]
    Raft(#[from] raft::Error),
    #[error("Snapshot {0}")]
    Snapshot(#[from] SnapError),
    #[error("Timeout {0}")]
    Timeout(String),
}

pub type Result<T> = result::Result<T, Error>;

impl From<Error> for errorpb::Error {
    fn from(err: Error) -> errorpb::Error {
        let message = format!("{}", err);
        let detail = match err {
            Error::RegionNotFound(region_id) => Some(errorpb::ErrorDetail::RegionNotFound {
                region_id,
            }),
            Error::RegionRemoved(region_id) => Some(errorpb::ErrorDetail::RegionRemoved {
                region_id,
            }),
            Error::NotLeader(region_id, leader) => Some(errorpb::ErrorDetail::NotLeader {
                region_id,
                leader,
            }),
            Error::StoreNotMatch(to_store_id, my_store_id) => {
                Some(errorpb::ErrorDetail::StoreNotMatch {
                    request_store_id: to_store_id,
                    actual_store_id: my_store_id,
                })
            }
            Error::KeyNotInRegion(key, region) => Some(errorpb::ErrorDetail::KeyNotInRegion {
                key,
                region_id: region.id,
                start_key: region.start_key,
                end_key: region.end_key,
            }),
            Error::EpochNotMatch(_, new_regions) => Some(errorpb::ErrorDetail::EpochNotMatch {
                current_regions: new_regions,
            }),
            Error::StaleCommand => Some(errorpb::ErrorDetail::StaleCommand),
            Error::Transport(DiscardReason::Full) => Some(errorpb::ErrorDetail::ServerIsBusy {
                reason: RAFTSTORE_IS_BUSY.to_owned(),
            }),
            _ => None,
        };
        errorpb::Error { message, detail }
    }
}

impl<T> From<TrySendError<T>> for Error {
    #[inline]
    fn from(e: TrySendError<T>) -> Error {
        match e {
            TrySendError::Full(_) => Error::Transport(DiscardReason::Full),
            TrySendError::Disconnected(_) => Error::Transport(DiscardReason::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_errorpb() {
        let err: errorpb::Error = Error::NotLeader(1, None).into();
        assert!(matches!(
            err.detail,
            Some(errorpb::ErrorDetail::NotLeader {
                region_id: 1,
                leader: None
            })
        ));

        let err: errorpb::Error = Error::StaleCommand.into();
        assert!(matches!(err.detail, Some(errorpb::ErrorDetail::StaleCommand)));

        let err: errorpb::Error = Error::Transport(DiscardReason::Full).into();
        assert!(matches!(
            err.detail,
            Some(errorpb::ErrorDetail::ServerIsBusy { .. })
        ));

        let err: errorpb::Error = Error::Timeout("t".to_owned()).into();
        assert!(err.detail.is_none());
    }
}
