// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Message and state types shared across the Kestrel components.
//!
//! These are the wire- and engine-level records of the system: region
//! metadata (`metapb`), replicated commands and their responses
//! (`raft_cmdpb`), store-local raft bookkeeping and message envelopes
//! (`raft_serverpb`), and the typed region errors surfaced to clients
//! (`errorpb`). Everything except the embedded raft messages is encoded
//! with bincode.

pub mod errorpb;
pub mod metapb;
pub mod raft_cmdpb;
pub mod raft_serverpb;
