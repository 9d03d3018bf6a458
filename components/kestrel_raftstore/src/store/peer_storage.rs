// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::cell::RefCell;
use std::error;
use std::sync::mpsc::{self, Receiver};

use kestrel_engine::{Engines, KvEngine, Mutable, Peekable, WriteBatch};
use kestrel_proto::metapb::Region;
use kestrel_proto::raft_serverpb::{
    PeerState, RaftApplyState, RaftLocalState, RaftSnapshotData, RegionLocalState,
    RaftTruncatedState,
};
use kestrel_util::worker::Scheduler;
use protobuf::Message;
use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, StorageError};

use crate::keys::{self, enc_end_key, enc_start_key};
use crate::store::snap::SnapKey;
use crate::store::util;
use crate::store::worker::RegionTask;
use crate::{Error, Result};

/// Log positions a bootstrapped (or freshly split) region starts from.
/// Leaving a gap below keeps the first real entry distinguishable from the
/// synthesized initial state.
pub const RAFT_INIT_LOG_TERM: u64 = 5;
pub const RAFT_INIT_LOG_INDEX: u64 = 5;

const MAX_SNAP_TRY_CNT: usize = 5;

pub fn first_index(apply_state: &RaftApplyState) -> u64 {
    apply_state.truncated_state.index + 1
}

pub fn last_index(raft_state: &RaftLocalState) -> u64 {
    raft_state.last_index
}

pub fn is_empty_snap(snap: &Snapshot) -> bool {
    snap.get_metadata().get_index() == 0
}

#[derive(Debug)]
pub enum SnapState {
    Relax,
    /// A snapshot is being generated by the region worker; the receiver
    /// yields it once ready.
    Generating(Receiver<Snapshot>),
    Applying,
}

impl PartialEq for SnapState {
    fn eq(&self, other: &SnapState) -> bool {
        matches!(
            (self, other),
            (SnapState::Relax, SnapState::Relax)
                | (SnapState::Generating(_), SnapState::Generating(_))
                | (SnapState::Applying, SnapState::Applying)
        )
    }
}

fn storage_error<E>(error: E) -> raft::Error
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    raft::Error::Store(StorageError::Other(error.into()))
}

/// Outcome of installing a snapshot: the region before and after. The
/// message handler folds this into the store's range index.
#[derive(Debug)]
pub struct ApplySnapResult {
    pub prev_region: Region,
    pub region: Region,
}

pub fn write_peer_state<W: Mutable>(kv_wb: &mut W, region: &Region, state: PeerState) -> Result<()> {
    let region_state = RegionLocalState {
        state,
        region: region.clone(),
    };
    kv_wb.put_msg(&keys::region_state_key(region.id), &region_state)?;
    Ok(())
}

pub fn write_initial_apply_state<W: Mutable>(kv_wb: &mut W, region_id: u64) -> Result<()> {
    let apply_state = RaftApplyState {
        applied_index: RAFT_INIT_LOG_INDEX,
        truncated_state: RaftTruncatedState {
            index: RAFT_INIT_LOG_INDEX,
            term: RAFT_INIT_LOG_TERM,
        },
    };
    kv_wb.put_msg(&keys::apply_state_key(region_id), &apply_state)?;
    Ok(())
}

pub fn write_initial_raft_state<W: Mutable>(raft_wb: &mut W, region_id: u64) -> Result<()> {
    let raft_state = RaftLocalState {
        term: RAFT_INIT_LOG_TERM,
        commit: RAFT_INIT_LOG_INDEX,
        last_index: RAFT_INIT_LOG_INDEX,
        last_term: RAFT_INIT_LOG_TERM,
        ..Default::default()
    };
    raft_wb.put_msg(&keys::raft_state_key(region_id), &raft_state)?;
    Ok(())
}

fn init_raft_state<EK: KvEngine>(engines: &Engines<EK>, region: &Region) -> Result<RaftLocalState> {
    match engines.raft.get_msg(&keys::raft_state_key(region.id))? {
        Some(state) => Ok(state),
        None => {
            let mut raft_state = RaftLocalState::default();
            if region.is_initialized() {
                // A new split region: its log starts at the synthesized
                // initial position.
                raft_state.term = RAFT_INIT_LOG_TERM;
                raft_state.commit = RAFT_INIT_LOG_INDEX;
                raft_state.last_index = RAFT_INIT_LOG_INDEX;
                raft_state.last_term = RAFT_INIT_LOG_TERM;
                let mut wb = engines.raft.write_batch();
                wb.put_msg(&keys::raft_state_key(region.id), &raft_state)?;
                engines.write_raft(&wb)?;
            }
            Ok(raft_state)
        }
    }
}

fn init_apply_state<EK: KvEngine>(engines: &Engines<EK>, region: &Region) -> Result<RaftApplyState> {
    match engines.kv.get_msg(&keys::apply_state_key(region.id))? {
        Some(state) => Ok(state),
        None => {
            let mut apply_state = RaftApplyState::default();
            if region.is_initialized() {
                apply_state.applied_index = RAFT_INIT_LOG_INDEX;
                apply_state.truncated_state = RaftTruncatedState {
                    index: RAFT_INIT_LOG_INDEX,
                    term: RAFT_INIT_LOG_TERM,
                };
            }
            Ok(apply_state)
        }
    }
}

fn entry_at<EK: KvEngine>(engines: &Engines<EK>, region_id: u64, idx: u64) -> Result<Option<Entry>> {
    let value = engines.raft.get_value(&keys::raft_log_key(region_id, idx))?;
    match value {
        None => Ok(None),
        Some(v) => {
            let mut entry = Entry::default();
            entry.merge_from_bytes(&v)?;
            Ok(Some(entry))
        }
    }
}

fn init_last_term<EK: KvEngine>(
    engines: &Engines<EK>,
    region: &Region,
    raft_state: &RaftLocalState,
    apply_state: &RaftApplyState,
) -> Result<u64> {
    let last_idx = raft_state.last_index;
    if last_idx == 0 {
        return Ok(0);
    }
    if last_idx == RAFT_INIT_LOG_INDEX {
        return Ok(RAFT_INIT_LOG_TERM);
    }
    if last_idx == apply_state.truncated_state.index {
        return Ok(apply_state.truncated_state.term);
    }
    match entry_at(engines, region.id, last_idx)? {
        Some(e) => Ok(e.get_term()),
        None => Err(Error::Other(kestrel_util::box_err!(
            "[region {}] entry at {} doesn't exist, may lose data",
            region.id,
            last_idx
        ))),
    }
}

fn init_applied_term<EK: KvEngine>(
    engines: &Engines<EK>,
    region: &Region,
    apply_state: &RaftApplyState,
) -> Result<u64> {
    if apply_state.applied_index == RAFT_INIT_LOG_INDEX {
        return Ok(RAFT_INIT_LOG_TERM);
    }
    let truncated = apply_state.truncated_state;
    if apply_state.applied_index == truncated.index {
        return Ok(truncated.term);
    }
    match entry_at(engines, region.id, apply_state.applied_index)? {
        Some(e) => Ok(e.get_term()),
        None => Err(Error::Other(kestrel_util::box_err!(
            "[region {}] applied entry at {} doesn't exist",
            region.id,
            apply_state.applied_index
        ))),
    }
}

pub struct PeerStorage<EK: KvEngine> {
    pub engines: Engines<EK>,
    pub peer_id: u64,
    region: Region,
    pub raft_state: RaftLocalState,
    pub apply_state: RaftApplyState,
    pub applied_index_term: u64,
    pub last_term: u64,

    pub snap_state: RefCell<SnapState>,
    snap_tried_cnt: RefCell<usize>,
    region_scheduler: Scheduler<RegionTask>,

    pub tag: String,
}

impl<EK: KvEngine> raft::Storage for PeerStorage<EK> {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.entries(low, high, max_size.into())
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        self.snapshot(request_index)
    }
}

impl<EK: KvEngine> PeerStorage<EK> {
    pub fn new(
        engines: Engines<EK>,
        region: &Region,
        region_scheduler: Scheduler<RegionTask>,
        peer_id: u64,
        tag: String,
    ) -> Result<PeerStorage<EK>> {
        let raft_state = init_raft_state(&engines, region)?;
        let apply_state = init_apply_state(&engines, region)?;
        if raft_state.last_index < apply_state.applied_index {
            panic!(
                "{} unexpected raft log index: last_index {} < applied {}",
                tag, raft_state.last_index, apply_state.applied_index
            );
        }
        let last_term = init_last_term(&engines, region, &raft_state, &apply_state)?;
        let applied_index_term = if region.is_initialized() {
            init_applied_term(&engines, region, &apply_state)?
        } else {
            0
        };
        Ok(PeerStorage {
            engines,
            peer_id,
            region: region.clone(),
            raft_state,
            apply_state,
            applied_index_term,
            last_term,
            snap_state: RefCell::new(SnapState::Relax),
            snap_tried_cnt: RefCell::new(0),
            region_scheduler,
            tag,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.region.is_initialized()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn set_region(&mut self, region: Region) {
        self.region = region;
    }

    pub fn initial_state(&self) -> raft::Result<RaftState> {
        let hard_state = self.raft_state.hard_state();
        if hard_state == HardState::default() {
            assert!(
                !self.is_initialized(),
                "{} peer is initialized but local state has empty hard state: {:?}",
                self.tag,
                self.raft_state
            );
            return Ok(RaftState::new(hard_state, Default::default()));
        }
        Ok(RaftState::new(
            hard_state,
            util::conf_state_from_region(&self.region),
        ))
    }

    fn check_range(&self, low: u64, high: u64) -> raft::Result<()> {
        if low > high {
            return Err(storage_error(format!(
                "low {} is greater than high {}",
                low, high
            )));
        }
        if low <= self.truncated_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index() + 1 {
            return Err(storage_error(format!(
                "entries' high {} is out of bound, last index {}",
                high,
                self.last_index()
            )));
        }
        Ok(())
    }

    pub fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> raft::Result<Vec<Entry>> {
        self.check_range(low, high)?;
        let mut ents = Vec::with_capacity((high - low) as usize);
        let mut total_size = 0u64;
        for idx in low..high {
            let entry = entry_at(&self.engines, self.region.id, idx)
                .map_err(|e| storage_error(format!("{}", e)))?
                .ok_or(raft::Error::Store(StorageError::Unavailable))?;
            if entry.get_index() != idx {
                panic!("{} raft log at {} holds entry {:?}", self.tag, idx, entry);
            }
            total_size += entry.compute_size() as u64;
            // Always fetch at least one entry, even oversized.
            if let Some(max) = max_size {
                if !ents.is_empty() && total_size > max {
                    break;
                }
            }
            ents.push(entry);
        }
        Ok(ents)
    }

    pub fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.truncated_index() {
            return Ok(self.truncated_term());
        }
        self.check_range(idx, idx + 1)?;
        if self.truncated_term() == self.last_term || idx == self.last_index() {
            return Ok(self.last_term);
        }
        let entry = entry_at(&self.engines, self.region.id, idx)
            .map_err(|e| storage_error(format!("{}", e)))?
            .ok_or(raft::Error::Store(StorageError::Unavailable))?;
        Ok(entry.get_term())
    }

    #[inline]
    pub fn first_index(&self) -> u64 {
        first_index(&self.apply_state)
    }

    #[inline]
    pub fn last_index(&self) -> u64 {
        last_index(&self.raft_state)
    }

    #[inline]
    pub fn applied_index(&self) -> u64 {
        self.apply_state.applied_index
    }

    #[inline]
    pub fn truncated_index(&self) -> u64 {
        self.apply_state.truncated_state.index
    }

    #[inline]
    pub fn truncated_term(&self) -> u64 {
        self.apply_state.truncated_state.term
    }

    pub fn is_applying_snapshot(&self) -> bool {
        *self.snap_state.borrow() == SnapState::Applying
    }

    pub fn is_generating_snapshot(&self) -> bool {
        matches!(*self.snap_state.borrow(), SnapState::Generating(_))
    }

    /// Returns the finished snapshot or schedules generation on the region
    /// worker. Raft retries on `SnapshotTemporarilyUnavailable`.
    pub fn snapshot(&self, request_index: u64) -> raft::Result<Snapshot> {
        let mut snap_state = self.snap_state.borrow_mut();
        let mut tried_cnt = self.snap_tried_cnt.borrow_mut();

        if let SnapState::Generating(recv) = &*snap_state {
            match recv.try_recv() {
                Ok(snap) => {
                    *snap_state = SnapState::Relax;
                    if self.validate_snap(&snap, request_index) {
                        *tried_cnt = 0;
                        return Ok(snap);
                    }
                    // Outdated result, generate again below.
                }
                Err(mpsc::TryRecvError::Empty) => {
                    return Err(raft::Error::Store(
                        StorageError::SnapshotTemporarilyUnavailable,
                    ));
                }
                Err(mpsc::TryRecvError::Disconnected) => {
                    // The worker dropped the sender; retry below.
                    *snap_state = SnapState::Relax;
                }
            }
        }

        if *tried_cnt >= MAX_SNAP_TRY_CNT {
            let cnt = *tried_cnt;
            *tried_cnt = 0;
            return Err(storage_error(format!(
                "failed to get snapshot after {} times",
                cnt
            )));
        }
        *tried_cnt += 1;

        let (tx, rx) = mpsc::sync_channel(1);
        *snap_state = SnapState::Generating(rx);
        if self
            .region_scheduler
            .schedule(RegionTask::Gen {
                region_id: self.region.id,
                notifier: tx,
            })
            .is_err()
        {
            return Err(storage_error("failed to schedule snapshot generation"));
        }
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }

    fn validate_snap(&self, snap: &Snapshot, request_index: u64) -> bool {
        let idx = snap.get_metadata().get_index();
        if idx < self.truncated_index() || idx < request_index {
            // Stale snapshot, generate again.
            return false;
        }
        let snap_data: RaftSnapshotData = match bincode::deserialize(snap.get_data()) {
            Ok(data) => data,
            Err(_) => return false,
        };
        let snap_epoch = snap_data.region.region_epoch;
        let latest_epoch = self.region.region_epoch;
        if snap_epoch.conf_ver < latest_epoch.conf_ver {
            return false;
        }
        true
    }

    /// Appends entries to the raft engine batch and removes any stale tail
    /// left over from a conflicting leader.
    pub fn append(&mut self, entries: Vec<Entry>, raft_wb: &mut EK::WriteBatch) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let prev_last_index = self.last_index();
        let (last_index, last_term) = {
            let e = entries.last().unwrap();
            (e.get_index(), e.get_term())
        };
        for entry in &entries {
            raft_wb.put(
                &keys::raft_log_key(self.region.id, entry.get_index()),
                &entry.write_to_bytes()?,
            )?;
        }
        for idx in (last_index + 1)..=prev_last_index {
            raft_wb.delete(&keys::raft_log_key(self.region.id, idx))?;
        }
        self.raft_state.last_index = last_index;
        self.raft_state.last_term = last_term;
        self.last_term = last_term;
        Ok(())
    }

    /// Deletes all metadata belonging to this region from both engines.
    pub fn clear_meta(&self, kv_wb: &mut EK::WriteBatch, raft_wb: &mut EK::WriteBatch) -> Result<()> {
        let region_id = self.region.id;
        kv_wb.delete(&keys::region_state_key(region_id))?;
        kv_wb.delete(&keys::apply_state_key(region_id))?;
        raft_wb.delete(&keys::raft_state_key(region_id))?;
        raft_wb.delete_range_cf(
            kestrel_engine::CF_DEFAULT,
            &keys::raft_log_key(region_id, 0),
            &keys::raft_log_key(region_id, u64::MAX),
        )?;
        Ok(())
    }

    /// Deletes all user data covered by this region.
    pub fn clear_data(&self) -> Result<()> {
        let (start, end) = (enc_start_key(&self.region), enc_end_key(&self.region));
        let mut wb = self.engines.kv.write_batch();
        for cf in kestrel_engine::ALL_CFS {
            wb.delete_range_cf(cf, &start, &end)?;
        }
        self.engines.write_kv(&wb)?;
        Ok(())
    }

    fn apply_snapshot(
        &mut self,
        snap: &Snapshot,
        kv_wb: &mut EK::WriteBatch,
        raft_wb: &mut EK::WriteBatch,
    ) -> Result<ApplySnapResult> {
        let snap_data: RaftSnapshotData = bincode::deserialize(snap.get_data())?;
        let prev_region = self.region.clone();
        let region = snap_data.region;

        if self.is_initialized() {
            // Stale metadata and data are wiped in the same batches that
            // install the new state.
            self.clear_meta(kv_wb, raft_wb)?;
            let (start, end) = (enc_start_key(&prev_region), enc_end_key(&prev_region));
            for cf in kestrel_engine::ALL_CFS {
                kv_wb.delete_range_cf(cf, &start, &end)?;
            }
        }

        write_peer_state(kv_wb, &region, PeerState::Applying)?;

        let idx = snap.get_metadata().get_index();
        let term = snap.get_metadata().get_term();
        self.raft_state.last_index = idx;
        self.raft_state.last_term = term;
        self.last_term = term;
        self.apply_state.applied_index = idx;
        self.apply_state.truncated_state = RaftTruncatedState { index: idx, term };
        self.applied_index_term = term;
        kv_wb.put_msg(&keys::apply_state_key(region.id), &self.apply_state)?;

        self.region = region.clone();
        Ok(ApplySnapResult {
            prev_region,
            region,
        })
    }

    /// Persists one ready batch: snapshot metadata, entries, and hard
    /// state go into a single atomic write per engine. If the ready holds
    /// a snapshot, its bulk data is installed through the region worker
    /// before this returns, so raft can safely advance.
    pub fn handle_raft_ready(&mut self, ready: &mut raft::Ready) -> Result<Option<ApplySnapResult>> {
        let mut kv_wb = self.engines.kv.write_batch();
        let mut raft_wb = self.engines.raft.write_batch();
        let prev_raft_state = self.raft_state;

        let apply_res = if !is_empty_snap(ready.snapshot()) {
            Some(self.apply_snapshot(ready.snapshot(), &mut kv_wb, &mut raft_wb)?)
        } else {
            None
        };

        if !ready.entries().is_empty() {
            self.append(ready.take_entries(), &mut raft_wb)?;
        }
        if let Some(hs) = ready.hs() {
            self.raft_state.set_hard_state(hs);
        }
        if prev_raft_state != self.raft_state {
            raft_wb.put_msg(&keys::raft_state_key(self.region.id), &self.raft_state)?;
        }

        // Kv writes first: the region state marking the snapshot as
        // applying must be durable before the raft state references it.
        if !kv_wb.is_empty() {
            self.engines.write_kv(&kv_wb)?;
        }
        if !raft_wb.is_empty() {
            self.engines.write_raft(&raft_wb)?;
        }

        if let Some(res) = &apply_res {
            *self.snap_state.borrow_mut() = SnapState::Applying;
            let snap_key = SnapKey::from_region_snap(res.region.id, ready.snapshot());
            let (tx, rx) = mpsc::sync_channel(1);
            self.region_scheduler
                .schedule(RegionTask::Apply {
                    region_id: res.region.id,
                    snap_key,
                    notifier: tx,
                })
                .map_err(|_| Error::Other("failed to schedule snapshot apply".into()))?;
            match rx.recv() {
                Ok(true) => {
                    *self.snap_state.borrow_mut() = SnapState::Relax;
                }
                res => panic!("{} failed to apply snapshot: {:?}", self.tag, res),
            }
        }

        Ok(apply_res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_engine::MemEngine;
    use kestrel_proto::metapb;
    use kestrel_util::worker::Worker;

    use crate::store::worker::RegionRunner;
    use crate::store::SnapManager;

    fn new_storage() -> (PeerStorage<MemEngine>, Worker<RegionTask>, tempfile::TempDir) {
        let engines = Engines::new(MemEngine::new(), MemEngine::new());
        let dir = tempfile::TempDir::new().unwrap();
        let snap_mgr = SnapManager::new(dir.path());
        snap_mgr.init().unwrap();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let runner = RegionRunner::new(engines.clone(), snap_mgr, logger);
        let worker = Worker::new("region-worker", runner);

        let region = metapb::Region {
            id: 1,
            region_epoch: metapb::RegionEpoch {
                conf_ver: 1,
                version: 1,
            },
            peers: vec![metapb::Peer { id: 2, store_id: 1 }],
            ..Default::default()
        };
        let mut kv_wb = engines.kv.write_batch();
        write_peer_state(&mut kv_wb, &region, PeerState::Normal).unwrap();
        write_initial_apply_state(&mut kv_wb, region.id).unwrap();
        engines.write_kv(&kv_wb).unwrap();
        let mut raft_wb = engines.raft.write_batch();
        write_initial_raft_state(&mut raft_wb, region.id).unwrap();
        engines.write_raft(&raft_wb).unwrap();

        let storage = PeerStorage::new(
            engines,
            &region,
            worker.scheduler(),
            2,
            "[region 1] 2".to_owned(),
        )
        .unwrap();
        (storage, worker, dir)
    }

    fn new_entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e
    }

    #[test]
    fn test_initial_positions() {
        let (storage, _worker, _dir) = new_storage();
        assert!(storage.is_initialized());
        assert_eq!(storage.first_index(), RAFT_INIT_LOG_INDEX + 1);
        assert_eq!(storage.last_index(), RAFT_INIT_LOG_INDEX);
        assert_eq!(storage.applied_index(), RAFT_INIT_LOG_INDEX);
        assert_eq!(storage.term(RAFT_INIT_LOG_INDEX).unwrap(), RAFT_INIT_LOG_TERM);
    }

    #[test]
    fn test_append_and_fetch() {
        let (mut storage, _worker, _dir) = new_storage();
        let mut wb = storage.engines.raft.write_batch();
        storage
            .append(vec![new_entry(6, 6), new_entry(7, 6), new_entry(8, 7)], &mut wb)
            .unwrap();
        storage.engines.write_raft(&wb).unwrap();

        assert_eq!(storage.last_index(), 8);
        assert_eq!(storage.last_term, 7);
        let ents = storage.entries(6, 9, None).unwrap();
        assert_eq!(ents.len(), 3);
        assert_eq!(storage.term(7).unwrap(), 6);

        // Compacted range is rejected.
        assert!(matches!(
            storage.entries(5, 9, None),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        // Beyond the log is rejected.
        assert!(storage.entries(8, 10, None).is_err());
    }

    #[test]
    fn test_append_truncates_conflicting_tail() {
        let (mut storage, _worker, _dir) = new_storage();
        let mut wb = storage.engines.raft.write_batch();
        storage
            .append(vec![new_entry(6, 6), new_entry(7, 6), new_entry(8, 6)], &mut wb)
            .unwrap();
        storage.engines.write_raft(&wb).unwrap();

        let mut wb = storage.engines.raft.write_batch();
        storage.append(vec![new_entry(6, 7)], &mut wb).unwrap();
        storage.engines.write_raft(&wb).unwrap();

        assert_eq!(storage.last_index(), 6);
        assert_eq!(storage.term(6).unwrap(), 7);
        assert!(storage.entries(7, 8, None).is_err());
    }

    #[test]
    fn test_snapshot_generation_is_async() {
        let (storage, _worker, _dir) = new_storage();
        // First call schedules generation.
        match storage.snapshot(0) {
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)) => {}
            other => panic!("unexpected {:?}", other),
        }
        // Worker finishes eventually and a later call observes it.
        let mut snap = None;
        for _ in 0..100 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            match storage.snapshot(0) {
                Ok(s) => {
                    snap = Some(s);
                    break;
                }
                Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        let snap = snap.expect("snapshot should be generated");
        assert_eq!(snap.get_metadata().get_index(), RAFT_INIT_LOG_INDEX);
        assert_eq!(snap.get_metadata().get_term(), RAFT_INIT_LOG_TERM);
        let data: RaftSnapshotData = bincode::deserialize(snap.get_data()).unwrap();
        assert_eq!(data.region.id, 1);
    }
}
