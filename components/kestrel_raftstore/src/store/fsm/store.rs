// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Store-level state: the shared region index and the handler for
//! messages no peer can take.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use kestrel_engine::{KvEngine, Peekable};
use kestrel_pd::StoreStats;
use kestrel_proto::metapb::{self, Region};
use kestrel_proto::raft_serverpb::{PeerState, RaftMessage, RegionLocalState};
use slog::{debug, error, info, Logger};

use crate::keys::{self, data_key, enc_end_key, enc_start_key};
use crate::store::fsm::peer::PeerFsm;
use crate::store::fsm::StoreContext;
use crate::store::msg::{PeerMsg, StoreMsg, StoreTick};
use crate::store::peer::Peer;
use crate::store::snap::SnapKey;
use crate::store::ticker::Ticker;
use crate::store::transport::Transport;
use crate::store::util;
use crate::store::worker::PdTask;
use crate::Result;

/// Shared, per-store registry of every region hosted here.
///
/// `region_ranges` indexes initialized regions by their encoded end key;
/// overlap queries reduce to a successor lookup. `regions` also holds
/// uninitialized regions (known by id only). Both maps move together under
/// one mutex; divergence between them is metadata corruption and aborts
/// the process at the point of detection.
pub struct StoreMeta {
    /// region end key -> region id
    pub region_ranges: BTreeMap<Vec<u8>, u64>,
    /// region id -> region
    pub regions: HashMap<u64, Region>,
    /// First vote messages for peers that cannot be created yet because
    /// their range is still covered by an existing region.
    pub pending_votes: Vec<RaftMessage>,
}

impl StoreMeta {
    pub fn new() -> StoreMeta {
        StoreMeta {
            region_ranges: BTreeMap::new(),
            regions: HashMap::new(),
            pending_votes: Vec::new(),
        }
    }

    /// Installs a fresh region descriptor for a live peer.
    pub fn set_region<EK: KvEngine>(&mut self, region: Region, peer: &mut Peer<EK>) {
        self.regions.insert(region.id, region.clone());
        peer.set_region(region);
    }

    /// All initialized regions whose range overlaps `region`'s range.
    pub fn overlap_regions(&self, region: &Region) -> Vec<Region> {
        let start_key = enc_start_key(region);
        let end_key = enc_end_key(region);
        let mut overlaps = Vec::new();
        for (_, id) in self
            .region_ranges
            .range((Excluded(start_key), Unbounded::<Vec<u8>>))
        {
            let exist_region = &self.regions[id];
            if enc_start_key(exist_region) >= end_key {
                break;
            }
            overlaps.push(exist_region.clone());
        }
        overlaps
    }
}

impl Default for StoreMeta {
    fn default() -> StoreMeta {
        StoreMeta::new()
    }
}

pub struct StoreFsm {
    pub store: metapb::Store,
    pub ticker: Ticker,
}

pub struct StoreMsgHandler<'a, EK: KvEngine, T: Transport> {
    fsm: &'a mut StoreFsm,
    ctx: &'a StoreContext<EK, T>,
}

impl<'a, EK: KvEngine, T: Transport> StoreMsgHandler<'a, EK, T> {
    pub fn new(fsm: &'a mut StoreFsm, ctx: &'a StoreContext<EK, T>) -> StoreMsgHandler<'a, EK, T> {
        StoreMsgHandler { fsm, ctx }
    }

    fn logger(&self) -> &Logger {
        &self.ctx.logger
    }

    pub fn handle_msg(&mut self, msg: StoreMsg) {
        match msg {
            StoreMsg::RaftMessage(raft_msg) => {
                if let Err(e) = self.on_raft_message(raft_msg) {
                    error!(self.logger(), "handle raft message failed"; "err" => %e);
                }
            }
            StoreMsg::Tick => self.on_tick(),
            StoreMsg::Start { store } => self.start(store),
        }
    }

    fn start(&mut self, store: metapb::Store) {
        self.fsm.store = store;
        self.fsm.ticker.schedule_store(StoreTick::SnapGc);
        self.fsm.ticker.schedule_store(StoreTick::PdStoreHeartbeat);
    }

    fn on_tick(&mut self) {
        self.fsm.ticker.tick_clock();
        if self.fsm.ticker.is_on_store_tick(StoreTick::SnapGc) {
            self.on_snap_mgr_gc();
        }
        if self.fsm.ticker.is_on_store_tick(StoreTick::PdStoreHeartbeat) {
            self.on_pd_store_heartbeat_tick();
        }
    }

    /// Fans the idle snapshot list out to the owning peers; files whose
    /// peer is gone are deleted right here.
    fn on_snap_mgr_gc(&mut self) {
        self.fsm.ticker.schedule_store(StoreTick::SnapGc);
        let snaps = match self.ctx.snap_mgr.list_idle_snap() {
            Ok(snaps) => snaps,
            Err(e) => {
                error!(self.logger(), "failed to list snapshots"; "err" => %e);
                return;
            }
        };
        if snaps.is_empty() {
            return;
        }
        let mut by_region: HashMap<u64, Vec<(SnapKey, bool)>> = HashMap::new();
        for (key, is_sending) in snaps {
            by_region
                .entry(key.region_id)
                .or_default()
                .push((key, is_sending));
        }
        for (region_id, snaps) in by_region {
            let keys: Vec<(SnapKey, bool)> = snaps.clone();
            if self
                .ctx
                .router
                .send(region_id, PeerMsg::GcSnap { snaps })
                .is_err()
            {
                // The peer no longer exists; its snapshots are garbage.
                for (key, is_sending) in keys {
                    debug!(
                        self.logger(),
                        "deleting unused snap file";
                        "snap_file" => %key,
                    );
                    self.ctx.snap_mgr.delete_snapshot(key, is_sending);
                }
            }
        }
    }

    fn on_pd_store_heartbeat_tick(&mut self) {
        self.fsm
            .ticker
            .schedule_store(StoreTick::PdStoreHeartbeat);
        let region_count = {
            let meta = self.ctx.store_meta.lock().unwrap();
            meta.regions.len() as u64
        };
        let stats = StoreStats {
            store_id: self.fsm.store.id,
            region_count,
        };
        if let Err(e) = self.ctx.pd_scheduler.schedule(PdTask::StoreHeartbeat { stats }) {
            error!(self.logger(), "failed to notify pd"; "err" => %e);
        }
    }

    fn on_raft_message(&mut self, msg: RaftMessage) -> Result<()> {
        let region_id = msg.region_id;
        if !self.maybe_create_peer(region_id, &msg)? {
            return Ok(());
        }
        let _ = self.ctx.router.send(region_id, PeerMsg::RaftMessage(msg));
        Ok(())
    }

    /// Creates an uninitialized peer for a message addressed to a region
    /// this store does not host yet. Returns false when the message should
    /// be dropped instead.
    fn maybe_create_peer(&mut self, region_id: u64, msg: &RaftMessage) -> Result<bool> {
        if msg.is_tombstone {
            // There is no peer left to garbage-collect.
            return Ok(false);
        }
        let target = msg.to_peer;
        if target.store_id != self.fsm.store.id {
            return Ok(false);
        }
        if msg.region_epoch.is_none() {
            return Ok(false);
        }
        if !util::is_initial_msg(&msg.message) {
            debug!(
                self.logger(),
                "target peer doesn't exist, drop message";
                "region_id" => region_id,
                "target_peer" => ?target,
                "message_type" => ?msg.message.get_msg_type(),
            );
            return Ok(false);
        }

        // A destroyed peer must never be recreated in the same incarnation:
        // the tombstone it left behind wins against any message that is
        // not from a strictly newer epoch.
        if let Some(local_state) = self
            .ctx
            .engines
            .kv
            .get_msg::<RegionLocalState>(&keys::region_state_key(region_id))?
        {
            if local_state.state == PeerState::Tombstone {
                let tombstone_epoch = local_state.region.region_epoch;
                let from_epoch = msg.region_epoch.unwrap();
                if !util::is_epoch_stale(tombstone_epoch, from_epoch) {
                    info!(
                        self.logger(),
                        "tombstone peer receives a stale message, drop";
                        "region_id" => region_id,
                        "tombstone_epoch" => ?tombstone_epoch,
                        "message_epoch" => ?from_epoch,
                    );
                    return Ok(false);
                }
            }
        }

        let mut meta = self.ctx.store_meta.lock().unwrap();
        if meta.regions.contains_key(&region_id) {
            // The peer exists (possibly uninitialized); let the router
            // deliver.
            return Ok(true);
        }

        // The sender told us its range; refuse creation while any local
        // region still covers it. The local region must split or be
        // destroyed first.
        let msg_start = data_key(&msg.start_key);
        let msg_end = if msg.end_key.is_empty() {
            keys::DATA_MAX_KEY.to_vec()
        } else {
            data_key(&msg.end_key)
        };
        if let Some((_, exist_id)) = meta
            .region_ranges
            .range((Excluded(msg_start), Unbounded::<Vec<u8>>))
            .next()
        {
            let exist_region = &meta.regions[exist_id];
            if enc_start_key(exist_region) < msg_end {
                debug!(
                    self.logger(),
                    "msg is overlapped with exist region";
                    "region_id" => region_id,
                    "exist_region" => ?exist_region,
                );
                if util::is_first_vote_msg(&msg.message) {
                    meta.pending_votes.push(msg.clone());
                }
                return Ok(false);
            }
        }

        let fsm = PeerFsm::replicate(
            &self.ctx.cfg,
            self.ctx.region_scheduler.clone(),
            self.ctx.engines.clone(),
            region_id,
            target,
            &self.ctx.logger,
        )?;
        // Uninitialized regions take no range yet; only the id map learns
        // about them.
        meta.regions
            .insert(region_id, fsm.peer.region().clone());
        self.ctx.router.register(region_id, fsm);
        let _ = self.ctx.router.force_send(region_id, PeerMsg::Start);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_proto::metapb::RegionEpoch;

    fn region(id: u64, start: &[u8], end: &[u8], version: u64) -> Region {
        Region {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            region_epoch: RegionEpoch {
                conf_ver: 1,
                version,
            },
            peers: vec![metapb::Peer { id: 100 + id, store_id: 1 }],
        }
    }

    fn insert(meta: &mut StoreMeta, r: Region) {
        meta.region_ranges.insert(enc_end_key(&r), r.id);
        meta.regions.insert(r.id, r);
    }

    #[test]
    fn test_overlap_regions() {
        let mut meta = StoreMeta::new();
        insert(&mut meta, region(1, b"", b"b", 1));
        insert(&mut meta, region(2, b"b", b"d", 1));
        insert(&mut meta, region(3, b"f", b"", 1));

        let probe = region(4, b"c", b"g", 1);
        let overlaps = meta.overlap_regions(&probe);
        let ids: Vec<u64> = overlaps.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);

        let probe = region(5, b"d", b"f", 1);
        assert!(meta.overlap_regions(&probe).is_empty());

        let probe = region(6, b"", b"", 1);
        assert_eq!(meta.overlap_regions(&probe).len(), 3);
    }

    #[test]
    fn test_ranges_disjoint_by_construction() {
        let mut meta = StoreMeta::new();
        insert(&mut meta, region(1, b"", b"m", 1));
        insert(&mut meta, region(2, b"m", b"", 1));
        // Every region overlaps exactly itself.
        for r in meta.regions.clone().values() {
            let overlaps = meta.overlap_regions(r);
            assert_eq!(overlaps.len(), 1);
            assert_eq!(overlaps[0].id, r.id);
        }
    }
}
