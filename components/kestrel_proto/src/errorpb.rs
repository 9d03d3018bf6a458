// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use crate::metapb;

/// A typed region error carried in a command response header. These are
/// routine cluster-topology answers, never fatal: the client is expected to
/// refresh its region cache and retry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub message: String,
    pub detail: Option<ErrorDetail>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ErrorDetail {
    NotLeader {
        region_id: u64,
        leader: Option<metapb::Peer>,
    },
    RegionNotFound {
        region_id: u64,
    },
    /// The peer serving this region has been removed from the store.
    RegionRemoved {
        region_id: u64,
    },
    KeyNotInRegion {
        key: Vec<u8>,
        region_id: u64,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
    /// `current_regions` carries the store's fresher view, including the
    /// sibling region when the mismatch was likely caused by a split.
    EpochNotMatch {
        current_regions: Vec<metapb::Region>,
    },
    StaleCommand,
    StoreNotMatch {
        request_store_id: u64,
        actual_store_id: u64,
    },
    ServerIsBusy {
        reason: String,
    },
}

impl Error {
    pub fn new(message: String, detail: ErrorDetail) -> Error {
        Error {
            message,
            detail: Some(detail),
        }
    }
}
