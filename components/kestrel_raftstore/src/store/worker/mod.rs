// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

mod pd;
mod raftlog_gc;
mod region;
mod split_check;

pub use self::pd::{PdRunner, PdTask};
pub use self::raftlog_gc::{RaftlogGcRunner, RaftlogGcTask};
pub use self::region::{RegionRunner, RegionTask};
pub use self::split_check::{SplitCheckRunner, SplitCheckTask};
