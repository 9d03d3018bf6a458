// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Region worker: generates snapshot files from the engine and ingests
//! received snapshot files into it.

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::SyncSender;

use kestrel_engine::{Engines, Iterable, KvEngine, Mutable, Peekable};
use kestrel_proto::raft_serverpb::{
    PeerState, RaftApplyState, RaftSnapshotData, RegionLocalState,
};
use kestrel_util::worker::Runnable;
use raft::eraftpb::Snapshot;
use slog::{error, info, Logger};

use crate::keys::{self, enc_end_key, enc_start_key};
use crate::store::peer_storage::RAFT_INIT_LOG_TERM;
use crate::store::snap::{SnapEntry, SnapKey, SnapManager};
use crate::store::util;
use crate::{Error, Result};

pub enum RegionTask {
    /// Generates a snapshot of the region at its applied index and hands
    /// it back through `notifier`.
    Gen {
        region_id: u64,
        notifier: SyncSender<Snapshot>,
    },
    /// Ingests the received snapshot file into the kv engine and flips the
    /// region out of the applying state.
    Apply {
        region_id: u64,
        snap_key: SnapKey,
        notifier: SyncSender<bool>,
    },
}

impl Display for RegionTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegionTask::Gen { region_id, .. } => {
                write!(f, "Snap gen for region {}", region_id)
            }
            RegionTask::Apply { region_id, snap_key, .. } => {
                write!(f, "Snap apply for region {} [{}]", region_id, snap_key)
            }
        }
    }
}

pub struct RegionRunner<EK: KvEngine> {
    engines: Engines<EK>,
    snap_mgr: SnapManager,
    logger: Logger,
}

impl<EK: KvEngine> RegionRunner<EK> {
    pub fn new(engines: Engines<EK>, snap_mgr: SnapManager, logger: Logger) -> RegionRunner<EK> {
        RegionRunner {
            engines,
            snap_mgr,
            logger,
        }
    }

    fn region_state(&self, region_id: u64) -> Result<RegionLocalState> {
        self.engines
            .kv
            .get_msg(&keys::region_state_key(region_id))?
            .ok_or_else(|| {
                Error::Other(
                    kestrel_util::box_err!("region state of {} not found", region_id),
                )
            })
    }

    fn apply_state(&self, region_id: u64) -> Result<RaftApplyState> {
        self.engines
            .kv
            .get_msg(&keys::apply_state_key(region_id))?
            .ok_or_else(|| {
                Error::Other(
                    kestrel_util::box_err!("apply state of {} not found", region_id),
                )
            })
    }

    /// Builds the snapshot file and the raft-level snapshot message. The
    /// engine snapshot is taken after reading the apply state, which is
    /// safe because apply state and data always move in one batch.
    fn generate_snap(&self, region_id: u64) -> Result<Snapshot> {
        let apply_state = self.apply_state(region_id)?;
        let region_state = self.region_state(region_id)?;
        let region = region_state.region;

        let idx = apply_state.applied_index;
        let term = if idx == apply_state.truncated_state.index {
            apply_state.truncated_state.term
        } else {
            let value = self
                .engines
                .raft
                .get_value(&keys::raft_log_key(region_id, idx))?
                .ok_or_else(|| {
                    Error::Other(
                        kestrel_util::box_err!("entry {} of {} not found", idx, region_id),
                    )
                })?;
            let mut entry = raft::eraftpb::Entry::default();
            protobuf::Message::merge_from_bytes(&mut entry, &value)?;
            entry.get_term()
        };
        debug_assert!(term >= RAFT_INIT_LOG_TERM);

        let key = SnapKey::new(region_id, term, idx);
        let mut builder = self.snap_mgr.get_snapshot_for_building(key)?;
        let kv_snap = self.engines.kv.snapshot();
        let (start, end) = (enc_start_key(&region), enc_end_key(&region));
        for cf in kestrel_engine::ALL_CFS {
            kv_snap.scan_cf(cf, &start, &end, |k, v| {
                builder
                    .add_entry(cf, keys::origin_key(k), v)
                    .map_err(|e| kestrel_engine::Error::Other(e.to_string()))?;
                Ok(true)
            })?;
        }
        let file_size = builder.save()?;

        let mut snap = Snapshot::default();
        let meta = snap.mut_metadata();
        meta.set_index(idx);
        meta.set_term(term);
        meta.set_conf_state(util::conf_state_from_region(&region));
        let snap_data = RaftSnapshotData { region, file_size };
        snap.set_data(bincode::serialize(&snap_data)?.into());
        Ok(snap)
    }

    /// Streams the snapshot file into the engine and marks the region
    /// normal in the same batch, so a crash re-runs the whole ingest.
    fn apply_snap(&self, region_id: u64, snap_key: SnapKey) -> Result<()> {
        let mut region_state = self.region_state(region_id)?;
        if region_state.state != PeerState::Applying {
            panic!(
                "[region {}] unexpected state {:?} while applying snapshot",
                region_id, region_state.state
            );
        }
        self.snap_mgr.register(snap_key, SnapEntry::Applying);
        let res = (|| -> Result<()> {
            let file = self.snap_mgr.get_snapshot_for_applying(snap_key)?;
            let mut wb = self.engines.kv.write_batch();
            file.scan(|cf, key, value| {
                wb.put_cf(cf, &keys::data_key(key), value)
                    .map_err(|e| crate::store::snap::SnapError::Io(std::io::Error::other(e.to_string())))?;
                Ok(())
            })?;
            region_state.state = PeerState::Normal;
            wb.put_msg(&keys::region_state_key(region_id), &region_state)?;
            self.engines.write_kv(&wb)?;
            Ok(())
        })();
        self.snap_mgr.deregister(snap_key, SnapEntry::Applying);
        res
    }
}

impl<EK: KvEngine> Runnable<RegionTask> for RegionRunner<EK> {
    fn run(&mut self, task: RegionTask) {
        match task {
            RegionTask::Gen {
                region_id,
                notifier,
            } => match self.generate_snap(region_id) {
                Ok(snap) => {
                    info!(self.logger, "snapshot generated"; "region_id" => region_id);
                    let _ = notifier.try_send(snap);
                }
                Err(e) => {
                    error!(
                        self.logger,
                        "failed to generate snapshot";
                        "region_id" => region_id,
                        "err" => %e,
                    );
                }
            },
            RegionTask::Apply {
                region_id,
                snap_key,
                notifier,
            } => match self.apply_snap(region_id, snap_key) {
                Ok(()) => {
                    info!(
                        self.logger,
                        "snapshot applied";
                        "region_id" => region_id,
                        "snap_key" => %snap_key,
                    );
                    let _ = notifier.send(true);
                }
                Err(e) => {
                    error!(
                        self.logger,
                        "failed to apply snapshot";
                        "region_id" => region_id,
                        "snap_key" => %snap_key,
                        "err" => %e,
                    );
                    let _ = notifier.send(false);
                }
            },
        }
    }
}
