// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! The per-store replication core of Kestrel.
//!
//! A store hosts one peer for each region placed on it. Every peer drives
//! its raft group forward, turns committed log entries into engine
//! mutations, and reacts to membership changes, snapshots, log compaction,
//! region splits, and stale-peer garbage collection. The modules here wire
//! those state machines together: the router delivers messages to per-peer
//! mailboxes, peer workers advance raft and persist ready batches, apply
//! workers execute committed entries, and background workers handle
//! snapshots, log GC, split checks, and placement-driver traffic.

#![allow(clippy::too_many_arguments)]

mod errors;
pub mod keys;
pub mod store;

pub use crate::errors::{DiscardReason, Error, Result};
