// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use kestrel_proto::raft_serverpb::RaftMessage;

use crate::Result;

/// Transports messages between raft peers on different stores.
///
/// Delivery is best-effort: a send failure is logged and the message
/// dropped, raft retransmits on its own schedule.
pub trait Transport: Send + Sync + Clone + 'static {
    fn send(&self, msg: RaftMessage) -> Result<()>;
}
