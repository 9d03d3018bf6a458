// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Raft-log GC worker: deletes compacted log entries from the raft
//! engine.

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;

use kestrel_engine::{Engines, KvEngine, Mutable};
use kestrel_util::worker::Runnable;
use slog::{debug, error, Logger};

use crate::keys;
use crate::Result;

pub struct RaftlogGcTask {
    pub region_id: u64,
    /// Deletes entries in `[start_idx, end_idx)`.
    pub start_idx: u64,
    pub end_idx: u64,
}

impl Display for RaftlogGcTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GC Raft Log [region: {}, from: {}, to: {}]",
            self.region_id, self.start_idx, self.end_idx
        )
    }
}

pub struct RaftlogGcRunner<EK: KvEngine> {
    engines: Engines<EK>,
    logger: Logger,
    /// Reports the number of deleted entries, used by tests.
    collected_notifier: Option<Sender<usize>>,
}

impl<EK: KvEngine> RaftlogGcRunner<EK> {
    pub fn new(engines: Engines<EK>, logger: Logger) -> RaftlogGcRunner<EK> {
        RaftlogGcRunner {
            engines,
            logger,
            collected_notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Sender<usize>) -> RaftlogGcRunner<EK> {
        self.collected_notifier = Some(notifier);
        self
    }

    fn gc(&self, task: &RaftlogGcTask) -> Result<usize> {
        if task.start_idx >= task.end_idx {
            return Ok(0);
        }
        let mut wb = self.engines.raft.write_batch();
        for idx in task.start_idx..task.end_idx {
            wb.delete(&keys::raft_log_key(task.region_id, idx))?;
        }
        let collected = (task.end_idx - task.start_idx) as usize;
        self.engines.write_raft(&wb)?;
        Ok(collected)
    }
}

impl<EK: KvEngine> Runnable<RaftlogGcTask> for RaftlogGcRunner<EK> {
    fn run(&mut self, task: RaftlogGcTask) {
        match self.gc(&task) {
            Ok(collected) => {
                debug!(
                    self.logger,
                    "gc raft log";
                    "region_id" => task.region_id,
                    "collected" => collected,
                );
                if let Some(notifier) = &self.collected_notifier {
                    let _ = notifier.send(collected);
                }
            }
            Err(e) => {
                error!(
                    self.logger,
                    "failed to gc raft log";
                    "region_id" => task.region_id,
                    "err" => %e,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use kestrel_engine::{MemEngine, Peekable};
    use kestrel_util::worker::Worker;

    use super::*;

    #[test]
    fn test_gc_deletes_range() {
        let engines = Engines::new(MemEngine::new(), MemEngine::new());
        let mut wb = engines.raft.write_batch();
        for idx in 0..100 {
            wb.put(&keys::raft_log_key(1, idx), b"entry").unwrap();
        }
        engines.write_raft(&wb).unwrap();

        let (tx, rx) = mpsc::channel();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let runner = RaftlogGcRunner::new(engines.clone(), logger).with_notifier(tx);
        let mut worker = Worker::new("raftlog-gc", runner);
        worker
            .scheduler()
            .schedule(RaftlogGcTask {
                region_id: 1,
                start_idx: 10,
                end_idx: 60,
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 50);
        assert!(engines
            .raft
            .get_value(&keys::raft_log_key(1, 9))
            .unwrap()
            .is_some());
        assert!(engines
            .raft
            .get_value(&keys::raft_log_key(1, 10))
            .unwrap()
            .is_none());
        assert!(engines
            .raft
            .get_value(&keys::raft_log_key(1, 59))
            .unwrap()
            .is_none());
        assert!(engines
            .raft
            .get_value(&keys::raft_log_key(1, 60))
            .unwrap()
            .is_some());
        worker.stop();
    }
}
