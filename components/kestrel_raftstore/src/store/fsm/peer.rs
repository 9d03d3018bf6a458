// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! The per-peer message handler: classifies and routes everything that
//! arrives at a peer's mailbox and orchestrates topology transitions
//! (membership changes, splits, snapshots, stale-peer GC, destruction).

use std::cmp;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::SystemTime;

use kestrel_engine::{Engines, KvEngine};
use kestrel_proto::metapb::{self, Region, RegionEpoch};
use kestrel_proto::raft_cmdpb::{
    AdminRequest, CompactLogRequest, RaftCmdRequest, RaftCmdResponse, RaftRequestHeader,
};
use kestrel_proto::raft_serverpb::{RaftMessage, RaftSnapshotData, RaftTruncatedState};
use kestrel_util::worker::Scheduler;
use raft::eraftpb::ConfChangeType;
use raft::INVALID_ID;
use slog::{debug, error, info, warn, Logger};

use crate::keys::enc_end_key;
use crate::store::cmd_resp;
use crate::store::config::Config;
use crate::store::fsm::apply::{self, ApplyMsg, ChangePeer, ExecResult, TaskRes};
use crate::store::fsm::StoreContext;
use crate::store::msg::{Callback, PeerMsg, PeerTick, StoreMsg};
use crate::store::peer::Peer;
use crate::store::peer_storage::ApplySnapResult;
use crate::store::snap::SnapKey;
use crate::store::ticker::Ticker;
use crate::store::transport::Transport;
use crate::store::util;
use crate::store::worker::{PdTask, RaftlogGcTask, RegionTask, SplitCheckTask};
use crate::{Error, Result};

pub struct PeerFsm<EK: KvEngine> {
    pub peer: Peer<EK>,
    pub ticker: Ticker,
    pub stopped: bool,
}

impl<EK: KvEngine> PeerFsm<EK> {
    /// Creates a peer of an initialized region (known range and peer
    /// list), typically at store startup or when applying a split.
    pub fn create(
        store_id: u64,
        cfg: &Config,
        region_scheduler: Scheduler<RegionTask>,
        engines: Engines<EK>,
        region: &Region,
        logger: &Logger,
    ) -> Result<PeerFsm<EK>> {
        let meta_peer = match util::find_peer(region, store_id) {
            None => {
                return Err(Error::Other(kestrel_util::box_err!(
                    "find no peer for store {} in region {:?}",
                    store_id,
                    region
                )));
            }
            Some(peer) => *peer,
        };
        info!(
            logger,
            "create peer";
            "region_id" => region.id,
            "peer_id" => meta_peer.id,
        );
        Ok(PeerFsm {
            peer: Peer::new(cfg, region_scheduler, engines, region, meta_peer, logger)?,
            ticker: Ticker::new(cfg),
            stopped: false,
        })
    }

    /// Creates an uninitialized peer: the region is only known by id until
    /// a snapshot installs its range and peer list.
    pub fn replicate(
        cfg: &Config,
        region_scheduler: Scheduler<RegionTask>,
        engines: Engines<EK>,
        region_id: u64,
        peer: metapb::Peer,
        logger: &Logger,
    ) -> Result<PeerFsm<EK>> {
        // The region will be retrieved later from a snapshot; for now only
        // its id is known.
        let region = Region {
            id: region_id,
            ..Default::default()
        };
        info!(
            logger,
            "replicate peer";
            "region_id" => region_id,
            "peer_id" => peer.id,
        );
        Ok(PeerFsm {
            peer: Peer::new(cfg, region_scheduler, engines, &region, peer, logger)?,
            ticker: Ticker::new(cfg),
            stopped: false,
        })
    }

    pub fn region_id(&self) -> u64 {
        self.peer.region_id()
    }

    pub fn peer_id(&self) -> u64 {
        self.peer.peer_id()
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

pub struct PeerMsgHandler<'a, EK: KvEngine, T: Transport> {
    fsm: &'a mut PeerFsm<EK>,
    ctx: &'a StoreContext<EK, T>,
}

impl<'a, EK: KvEngine, T: Transport> PeerMsgHandler<'a, EK, T> {
    pub fn new(fsm: &'a mut PeerFsm<EK>, ctx: &'a StoreContext<EK, T>) -> PeerMsgHandler<'a, EK, T> {
        PeerMsgHandler { fsm, ctx }
    }

    fn logger(&self) -> &Logger {
        &self.fsm.peer.logger
    }

    fn region_id(&self) -> u64 {
        self.fsm.peer.region_id()
    }

    fn peer_id(&self) -> u64 {
        self.fsm.peer.peer_id()
    }

    fn store_id(&self) -> u64 {
        self.ctx.store.id
    }

    fn region(&self) -> &Region {
        self.fsm.peer.region()
    }

    pub fn handle_msg(&mut self, msg: PeerMsg<EK>) {
        match msg {
            PeerMsg::RaftMessage(raft_msg) => {
                if let Err(e) = self.on_raft_message(raft_msg) {
                    error!(self.logger(), "handle raft message error"; "err" => %e);
                }
            }
            PeerMsg::RaftCommand(cmd) => self.propose_raft_command(cmd.request, cmd.callback),
            PeerMsg::Tick => self.on_tick(),
            PeerMsg::ApplyRes(res) => self.on_apply_res(res),
            PeerMsg::SplitRegion {
                region_epoch,
                split_keys,
                callback,
            } => {
                info!(
                    self.logger(),
                    "on split";
                    "split_keys" => %util::KeysInfoFormatter(split_keys.iter()),
                );
                self.on_prepare_split_region(region_epoch, split_keys, callback);
            }
            PeerMsg::ApproximateRegionSize(size) => self.on_approximate_region_size(size),
            PeerMsg::GcSnap { snaps } => self.on_gc_snap(snaps),
            PeerMsg::Start => self.start(),
        }
    }

    /// Advances raft after a batch of messages and reacts to an installed
    /// snapshot by updating the store's range index.
    pub fn handle_raft_ready(&mut self) {
        if self.fsm.stopped {
            return;
        }
        if let Some(apply_result) = self.fsm.peer.handle_raft_ready(self.ctx) {
            self.on_ready_apply_snapshot(apply_result);
        }
    }

    fn start(&mut self) {
        self.ctx
            .apply_router
            .schedule(ApplyMsg::Registration(self.fsm.peer.registration()));
        let _ = self.ctx.tick_driver.send(self.region_id());
        self.fsm.ticker.schedule(PeerTick::Raft);
        self.fsm.ticker.schedule(PeerTick::RaftLogGc);
        self.fsm.ticker.schedule(PeerTick::SplitRegionCheck);
        self.fsm.ticker.schedule(PeerTick::PdHeartbeat);
    }

    fn on_tick(&mut self) {
        if self.fsm.stopped {
            return;
        }
        self.fsm.ticker.tick_clock();
        if self.fsm.ticker.is_on_tick(PeerTick::Raft) {
            self.on_raft_base_tick();
        }
        if self.fsm.ticker.is_on_tick(PeerTick::RaftLogGc) {
            self.on_raft_gc_log_tick();
        }
        if self.fsm.ticker.is_on_tick(PeerTick::PdHeartbeat) {
            self.on_pd_heartbeat_tick();
        }
        if self.fsm.ticker.is_on_tick(PeerTick::SplitRegionCheck) {
            self.on_split_region_check_tick();
        }
        let _ = self.ctx.tick_driver.send(self.region_id());
    }

    fn on_raft_base_tick(&mut self) {
        if self.fsm.peer.pending_remove {
            return;
        }
        // With a snapshot pending, an election timeout could not pass the
        // pending conf change check anyway: first index has already been
        // moved past last index.
        if self.fsm.peer.is_applying_snapshot() || self.fsm.peer.has_pending_snapshot() {
            self.fsm.ticker.schedule(PeerTick::Raft);
            return;
        }
        self.fsm.peer.raft_group.tick();
        self.fsm.ticker.schedule(PeerTick::Raft);
    }

    fn on_raft_gc_log_tick(&mut self) {
        self.fsm.ticker.schedule(PeerTick::RaftLogGc);
        if !self.fsm.peer.is_leader() {
            // Followers only reschedule; the leader proposes the
            // truncation for the whole group.
            return;
        }

        let applied_idx = self.fsm.peer.get_store().applied_index();
        let first_idx = self.fsm.peer.get_store().first_index();
        if applied_idx <= first_idx
            || applied_idx - first_idx < self.ctx.cfg.raft_log_gc_count_limit
        {
            return;
        }

        // Keep the entry at the applied index resident for followers that
        // are exactly caught up.
        assert!(applied_idx > 0);
        let compact_idx = applied_idx - 1;
        if compact_idx < first_idx {
            // In case compact_idx == first_idx before subtraction.
            return;
        }

        let term = self
            .fsm
            .peer
            .raft_group
            .raft
            .raft_log
            .term(compact_idx)
            .unwrap_or_else(|e| {
                panic!(
                    "{} failed to load term of applied {} first {} compact {}: {:?}",
                    self.fsm.peer.tag, applied_idx, first_idx, compact_idx, e
                )
            });

        let request = new_compact_log_request(
            self.region_id(),
            self.fsm.peer.peer,
            compact_idx,
            term,
        );
        self.propose_raft_command(request, Callback::None);
    }

    fn on_split_region_check_tick(&mut self) {
        self.fsm.ticker.schedule(PeerTick::SplitRegionCheck);
        // To avoid frequent scans, new tasks are only queued when all
        // previous tasks have finished.
        if self.ctx.split_check_scheduler.is_busy() {
            return;
        }
        if !self.fsm.peer.is_leader() {
            return;
        }
        if self.fsm.peer.approximate_size.is_some()
            && self.fsm.peer.size_diff_hint < self.ctx.cfg.region_split_size.0 / 8
        {
            return;
        }
        if let Err(e) = self.ctx.split_check_scheduler.schedule(SplitCheckTask {
            region: self.region().clone(),
        }) {
            error!(self.logger(), "failed to schedule split check"; "err" => %e);
            return;
        }
        self.fsm.peer.size_diff_hint = 0;
    }

    fn on_pd_heartbeat_tick(&mut self) {
        self.fsm.ticker.schedule(PeerTick::PdHeartbeat);
        self.fsm.peer.check_peers();

        if !self.fsm.peer.is_leader() {
            return;
        }
        self.fsm.peer.heartbeat_pd(self.ctx);
    }

    fn on_approximate_region_size(&mut self, size: u64) {
        self.fsm.peer.approximate_size = Some(size);
    }

    fn on_gc_snap(&mut self, snaps: Vec<(SnapKey, bool)>) {
        let store = self.fsm.peer.get_store();
        let compacted_idx = store.truncated_index();
        let compacted_term = store.truncated_term();
        let is_applying_snap = store.is_applying_snapshot();
        for (key, is_sending) in snaps {
            if is_sending {
                let snap = match self.ctx.snap_mgr.get_snapshot_for_sending(key) {
                    Ok(snap) => snap,
                    Err(e) => {
                        error!(
                            self.logger(),
                            "failed to load snapshot";
                            "snapshot" => %key,
                            "err" => %e,
                        );
                        continue;
                    }
                };
                if key.term < compacted_term || key.idx < compacted_idx {
                    info!(
                        self.logger(),
                        "deleting compacted snap file";
                        "snap_file" => %key,
                    );
                    self.ctx.snap_mgr.delete_snapshot(key, true);
                } else if let Ok(modified) = snap.modified() {
                    if let Ok(elapsed) = SystemTime::now().duration_since(modified) {
                        if elapsed > self.ctx.cfg.snap_gc_timeout.0 {
                            info!(
                                self.logger(),
                                "deleting expired snap file";
                                "snap_file" => %key,
                            );
                            self.ctx.snap_mgr.delete_snapshot(key, true);
                        }
                    }
                }
            } else if key.term <= compacted_term
                && (key.idx < compacted_idx || (key.idx == compacted_idx && !is_applying_snap))
            {
                info!(
                    self.logger(),
                    "deleting applied snap file";
                    "snap_file" => %key,
                );
                self.ctx.snap_mgr.delete_snapshot(key, false);
            }
        }
    }

    fn on_raft_message(&mut self, msg: RaftMessage) -> Result<()> {
        debug!(
            self.logger(),
            "handle raft message";
            "message_type" => ?msg.message.get_msg_type(),
            "from_peer_id" => msg.from_peer.id,
            "to_peer_id" => msg.to_peer.id,
        );
        if !self.validate_raft_message(&msg) {
            return Ok(());
        }
        if self.fsm.peer.pending_remove || self.fsm.stopped {
            return Ok(());
        }
        if msg.is_tombstone {
            // A tombstone tells us to remove ourselves.
            self.handle_gc_peer_msg(&msg);
            return Ok(());
        }
        if self.check_msg(&msg) {
            return Ok(());
        }
        if let Some(key) = self.check_snapshot(&msg)? {
            // The rejected snapshot file will not be used again; deleting
            // it here is fine. If the same snapshot is resent it fails the
            // check again, so a missing file is never noticed.
            self.ctx.snap_mgr.delete_snapshot(key, false);
            return Ok(());
        }
        self.fsm.peer.insert_peer_cache(msg.from_peer);
        let from_peer_id = msg.from_peer.id;
        self.fsm.peer.step(msg.message)?;
        if self.fsm.peer.any_new_peer_catch_up(from_peer_id) {
            self.fsm.peer.heartbeat_pd(self.ctx);
        }
        Ok(())
    }

    /// Returns false when the message is invalid and must be ignored.
    fn validate_raft_message(&self, msg: &RaftMessage) -> bool {
        let to = msg.to_peer;
        if to.store_id != self.store_id() {
            warn!(
                self.logger(),
                "store not match, ignore it";
                "to_store_id" => to.store_id,
                "my_store_id" => self.store_id(),
            );
            return false;
        }
        if msg.region_epoch.is_none() {
            error!(self.logger(), "missing epoch in raft message, ignore it");
            return false;
        }
        true
    }

    /// Checks if the message is sent to the correct peer incarnation.
    ///
    /// Returns true when the message can be dropped silently.
    fn check_msg(&mut self, msg: &RaftMessage) -> bool {
        let from_epoch = msg.region_epoch.unwrap();
        let is_vote_msg = util::is_vote_msg(&msg.message);
        let from_store_id = msg.from_peer.store_id;

        // Consider three nodes [1, 2, 3] with 1 as leader:
        // a. 1 removes 2; 2 may still send an append response to 1. The
        //  stale message is ignored, 2 removes itself once it applies the
        //  conf change.
        // b. 2 is isolated, 1 removes 2. When 2 rejoins it sends stale
        //  vote requests to 1 and 3; they tell 2 to gc itself.
        // c. 2 is isolated but reaches 3; 1 removes 3. 2's stale votes to
        //  3 are ignored (2 is still a member in 3's view).
        // d. 2 is isolated but reaches 3; 1 removes 2, adds 4, removes 3.
        //  3 tells 2 to gc itself.
        // e. 2 is isolated; the membership churns until a new leader
        //  reaches 2 again, 2 rejoins the group.
        if util::is_epoch_stale(from_epoch, self.region().region_epoch)
            && util::find_peer(self.region(), from_store_id).is_none()
        {
            // The message is stale and not in the current region.
            handle_stale_msg(
                &self.ctx.trans,
                msg,
                self.region().region_epoch,
                is_vote_msg,
                self.logger(),
            );
            return true;
        }

        let target = msg.to_peer;
        match target.id.cmp(&self.peer_id()) {
            cmp::Ordering::Less => {
                info!(
                    self.logger(),
                    "target peer id is smaller, msg maybe stale";
                    "target_peer" => ?target,
                );
                true
            }
            cmp::Ordering::Greater => {
                if self.fsm.peer.maybe_destroy() {
                    info!(
                        self.logger(),
                        "is stale as received a larger peer, destroying";
                        "target_peer" => ?target,
                    );
                    self.destroy_peer();
                    // Bounce the message through the store mailbox so the
                    // newer incarnation gets created.
                    if let Err(e) = self
                        .ctx
                        .router
                        .send_store(StoreMsg::RaftMessage(msg.clone()))
                    {
                        info!(
                            self.logger(),
                            "failed to send back store message, are we shutting down?";
                            "err" => %e,
                        );
                    }
                }
                true
            }
            cmp::Ordering::Equal => false,
        }
    }

    fn handle_gc_peer_msg(&mut self, msg: &RaftMessage) {
        let from_epoch = msg.region_epoch.unwrap();
        if !util::is_epoch_stale(self.region().region_epoch, from_epoch) {
            return;
        }
        if msg.to_peer != self.fsm.peer.peer {
            info!(self.logger(), "receive stale gc message, ignore");
            return;
        }
        info!(
            self.logger(),
            "receives gc message, trying to remove";
            "to_peer" => ?msg.to_peer,
        );
        if self.fsm.peer.maybe_destroy() {
            self.destroy_peer();
        }
    }

    /// Returns `None` when the message carries no snapshot or the snapshot
    /// conflicts with nothing; otherwise the key of the rejected snapshot
    /// file.
    fn check_snapshot(&mut self, msg: &RaftMessage) -> Result<Option<SnapKey>> {
        if !msg.message.has_snapshot()
            || crate::store::peer_storage::is_empty_snap(msg.message.get_snapshot())
        {
            return Ok(None);
        }

        let region_id = msg.region_id;
        let snap = msg.message.get_snapshot();
        let key = SnapKey::from_region_snap(region_id, snap);
        let snap_data: RaftSnapshotData = bincode::deserialize(snap.get_data())?;
        let snap_region = snap_data.region;
        let peer_id = msg.to_peer.id;

        if snap_region.peers.iter().all(|p| p.id != peer_id) {
            info!(
                self.logger(),
                "snapshot doesn't contain to peer, skip";
                "snap" => ?snap_region,
                "to_peer" => ?msg.to_peer,
            );
            return Ok(Some(key));
        }

        let meta = self.ctx.store_meta.lock().unwrap();
        if meta.regions.get(&self.region_id()) != Some(self.region()) {
            if !self.fsm.peer.is_initialized() {
                info!(self.logger(), "stale delegate detected, skip");
                return Ok(Some(key));
            }
            panic!(
                "{} meta corrupted: {:?} != {:?}",
                self.fsm.peer.tag,
                meta.regions.get(&self.region_id()),
                self.region()
            );
        }
        for region in meta.overlap_regions(&snap_region) {
            if region.id == snap_region.id {
                continue;
            }
            info!(
                self.logger(),
                "region overlapped";
                "exist" => ?region,
                "snap" => ?snap_region,
            );
            return Ok(Some(key));
        }

        Ok(None)
    }

    fn destroy_peer(&mut self) {
        info!(self.logger(), "starts destroy");
        let region_id = self.region_id();
        // We can't destroy a peer which is installing a snapshot.
        assert!(!self.fsm.peer.is_applying_snapshot());

        let mut meta = self.ctx.store_meta.lock().unwrap();

        if let Err(e) = self.ctx.pd_scheduler.schedule(PdTask::DestroyPeer { region_id }) {
            error!(self.logger(), "failed to notify pd"; "err" => %e);
        }
        self.ctx.apply_router.schedule(ApplyMsg::Destroy { region_id });

        let is_initialized = self.fsm.peer.is_initialized();
        if let Err(e) = self.fsm.peer.destroy() {
            // Without the panic the peer would be recreated on the next
            // restart and gc'ed again, but an overlap region created in
            // between would lose its data to that gc.
            panic!("{} destroy err {:?}", self.fsm.peer.tag, e);
        }
        self.ctx.router.close(region_id);
        self.fsm.stop();

        if is_initialized
            && meta
                .region_ranges
                .remove(&enc_end_key(self.fsm.peer.region()))
                .is_none()
        {
            panic!("{} meta corruption detected", self.fsm.peer.tag);
        }
        if meta.regions.remove(&region_id).is_none() {
            panic!("{} meta corruption detected", self.fsm.peer.tag);
        }
    }

    fn on_apply_res(&mut self, res: TaskRes) {
        match res {
            TaskRes::Apply(mut res) => {
                debug!(self.logger(), "async apply finished"; "res" => ?res);
                if res.apply_state.applied_index <= self.fsm.peer.get_store().applied_index() {
                    // A result computed before a snapshot overwrote the
                    // peer; everything in it is already superseded.
                    debug!(self.logger(), "stale apply result, ignore");
                    return;
                }
                for result in res.exec_res.drain(..) {
                    match result {
                        ExecResult::ChangePeer(cp) => self.on_ready_change_peer(cp),
                        ExecResult::CompactLog { state, first_index } => {
                            self.on_ready_compact_log(first_index, state)
                        }
                        ExecResult::SplitRegion { derived, regions } => {
                            self.on_ready_split_region(derived, regions)
                        }
                        ExecResult::TransferLeader { peer } => {
                            self.on_ready_transfer_leader(peer)
                        }
                    }
                    if self.fsm.stopped {
                        return;
                    }
                }
                self.fsm.peer.post_apply(&res);

                let diff = self.fsm.peer.size_diff_hint as i64 + res.metrics.size_diff_hint;
                self.fsm.peer.size_diff_hint = cmp::max(diff, 0) as u64;
            }
            TaskRes::Destroy { .. } => {
                // Acknowledgement of a destroy this peer initiated; its
                // mailbox is already closed.
            }
        }
    }

    fn on_ready_change_peer(&mut self, cp: ChangePeer) {
        if cp.conf_change.get_node_id() == INVALID_ID {
            // Apply failed, skip. Membership did not change, so raft must
            // not observe the conf change either.
            return;
        }
        match self.fsm.peer.raft_group.apply_conf_change(&cp.conf_change) {
            Ok(_) => {}
            // The driver could dispatch redundant conf changes.
            Err(raft::Error::NotExists { .. }) | Err(raft::Error::Exists { .. }) => {}
            Err(e) => panic!(
                "{} failed to apply conf change {:?}: {:?}",
                self.fsm.peer.tag, cp.conf_change, e
            ),
        }

        {
            let mut meta = self.ctx.store_meta.lock().unwrap();
            meta.set_region(cp.region.clone(), &mut self.fsm.peer);
        }

        let change_type = cp.conf_change.get_change_type();
        let peer_id = cp.peer.id;
        let now = std::time::Instant::now();
        match change_type {
            ConfChangeType::AddNode => {
                // Track the fresh peer so heartbeats can report it pending
                // until it catches up.
                self.fsm.peer.peer_heartbeats.insert(peer_id, now);
                if self.fsm.peer.is_leader() {
                    self.fsm.peer.peers_start_pending_time.push((peer_id, now));
                }
                self.fsm.peer.insert_peer_cache(cp.peer);
            }
            ConfChangeType::RemoveNode => {
                self.fsm.peer.peer_heartbeats.remove(&peer_id);
                if self.fsm.peer.is_leader() {
                    self.fsm
                        .peer
                        .peers_start_pending_time
                        .retain(|&(p, _)| p != peer_id);
                }
                self.fsm.peer.remove_peer_from_cache(peer_id);
            }
            ConfChangeType::AddLearnerNode => {
                panic!("{} unexpected learner conf change", self.fsm.peer.tag)
            }
        }

        if self.fsm.peer.is_leader() {
            // Notify pd immediately.
            info!(
                self.logger(),
                "notify pd with change peer region";
                "region" => ?self.region(),
            );
            self.fsm.peer.heartbeat_pd(self.ctx);
        }

        // We only care about removing this peer now.
        if change_type == ConfChangeType::RemoveNode && cp.peer.store_id == self.store_id() {
            if self.peer_id() == peer_id {
                self.destroy_peer();
            } else {
                panic!(
                    "{} trying to remove unknown peer {:?}",
                    self.fsm.peer.tag, cp.peer
                );
            }
        }
    }

    fn on_ready_compact_log(&mut self, first_index: u64, state: RaftTruncatedState) {
        debug!(
            self.logger(),
            "log compaction applied";
            "first_index" => first_index,
            "truncated_index" => state.index,
        );
        let task = RaftlogGcTask {
            region_id: self.region_id(),
            start_idx: self.fsm.peer.last_compacted_idx,
            end_idx: state.index + 1,
        };
        self.fsm.peer.last_compacted_idx = task.end_idx;
        if let Err(e) = self.ctx.raftlog_gc_scheduler.schedule(task) {
            error!(self.logger(), "failed to schedule compact task"; "err" => %e);
        }
    }

    fn on_ready_split_region(&mut self, derived: Region, regions: Vec<Region>) {
        let region_id = derived.id;
        let mut meta = self.ctx.store_meta.lock().unwrap();
        meta.set_region(derived, &mut self.fsm.peer);
        self.fsm.peer.size_diff_hint = 0;
        let is_leader = self.fsm.peer.is_leader();
        if is_leader {
            self.fsm.peer.heartbeat_pd(self.ctx);
            // Notify pd immediately to let it update the region meta.
            info!(
                self.logger(),
                "notify pd with split";
                "split_count" => regions.len(),
            );
            if let Err(e) = self.ctx.pd_scheduler.schedule(PdTask::ReportBatchSplit {
                regions: regions.clone(),
            }) {
                error!(self.logger(), "failed to notify pd"; "err" => %e);
            }
        }

        // The parent's old range is keyed by its pre-split end key, which
        // the right-most child inherited.
        let last_key = enc_end_key(regions.last().unwrap());
        if meta.region_ranges.remove(&last_key).is_none() {
            panic!("{} original region should exist", self.fsm.peer.tag);
        }
        // Not correct anymore; the split checker will refresh it.
        self.fsm.peer.approximate_size = None;

        for new_region in regions {
            let new_region_id = new_region.id;
            let not_exist = meta
                .region_ranges
                .insert(enc_end_key(&new_region), new_region_id)
                .is_none();
            assert!(not_exist, "[region {}] should not exist", new_region_id);
            if new_region_id == region_id {
                continue;
            }

            info!(
                self.logger(),
                "insert new region";
                "new_region_id" => new_region_id,
                "region" => ?new_region,
            );
            if let Some(r) = meta.regions.get(&new_region_id) {
                // A new node may be added by conf change while its
                // snapshot is slow; the first vote message then created an
                // uninitialized peer before the split applied here. That
                // uninitialized peer is superseded and removed directly.
                if r.is_initialized() {
                    panic!(
                        "[region {}] duplicated region {:?} for split region {:?}",
                        new_region_id, r, new_region
                    );
                }
                self.ctx.router.close(new_region_id);
            }

            let mut new_peer = match PeerFsm::create(
                self.store_id(),
                &self.ctx.cfg,
                self.ctx.region_scheduler.clone(),
                self.ctx.engines.clone(),
                &new_region,
                &self.ctx.logger,
            ) {
                Ok(new_peer) => new_peer,
                Err(e) => {
                    // The peer information is already written into the
                    // engine, this can't be recovered in place.
                    panic!("create new split region {:?} err {:?}", new_region, e);
                }
            };
            let meta_peer = new_peer.peer.peer;

            for p in &new_region.peers {
                new_peer.peer.insert_peer_cache(*p);
            }

            // The new peer of the old leader is the most likely next
            // leader; campaigning immediately avoids a leaderless window.
            let campaigned = new_peer.peer.maybe_campaign(is_leader);

            if is_leader {
                // The new region is likely to elect this store's peer;
                // heartbeat immediately to reduce client query misses.
                new_peer.peer.heartbeat_pd(self.ctx);
            }

            meta.regions.insert(new_region_id, new_region.clone());
            self.ctx.router.register(new_region_id, new_peer);
            self.ctx
                .router
                .force_send(new_region_id, PeerMsg::Start)
                .unwrap();

            if !campaigned {
                // Deliver the first queued vote addressed to this new
                // peer, if any arrived before it existed.
                if let Some(pos) = meta
                    .pending_votes
                    .iter()
                    .position(|m| m.to_peer == meta_peer)
                {
                    let vote = meta.pending_votes.remove(pos);
                    let _ = self
                        .ctx
                        .router
                        .send(new_region_id, PeerMsg::RaftMessage(vote));
                }
            }
        }
    }

    fn on_ready_transfer_leader(&mut self, peer: metapb::Peer) {
        if self.fsm.peer.is_leader() && peer.id != self.peer_id() {
            self.fsm.peer.transfer_leader(&peer);
        }
    }

    fn on_ready_apply_snapshot(&mut self, apply_result: ApplySnapResult) {
        let prev_region = apply_result.prev_region;
        let region = apply_result.region;

        info!(
            self.logger(),
            "snapshot is applied";
            "region" => ?region,
        );

        let mut meta = self.ctx.store_meta.lock().unwrap();
        let initialized = prev_region.is_initialized();
        if initialized {
            info!(
                self.logger(),
                "region changed after applying snapshot";
                "prev_region" => ?prev_region,
                "region" => ?region,
            );
            if meta.region_ranges.remove(&enc_end_key(&prev_region)).is_none() {
                panic!(
                    "{} meta corruption detected, no range for {:?}",
                    self.fsm.peer.tag, prev_region
                );
            }
        }
        if let Some(r) = meta.region_ranges.insert(enc_end_key(&region), region.id) {
            panic!(
                "{} unexpected old region {} in range index",
                self.fsm.peer.tag, r
            );
        }
        meta.regions.insert(region.id, region);
    }

    fn pre_propose_raft_command(&mut self, msg: &RaftCmdRequest) -> Result<()> {
        // Check store_id, making sure the msg is dispatched to the right
        // place.
        util::check_store_id(msg, self.store_id())?;

        // Check whether the store has the right peer to handle the
        // request.
        let region_id = self.region_id();
        let leader_id = self.fsm.peer.leader_id();
        if !self.fsm.peer.is_leader() {
            let leader = self.fsm.peer.get_peer_from_cache(leader_id);
            return Err(Error::NotLeader(region_id, leader));
        }
        // peer_id must be the same as the peer's.
        util::check_peer_id(msg, self.peer_id())?;
        // Check whether the term is stale.
        util::check_term(msg, self.fsm.peer.term())?;

        match util::check_region_epoch(msg, self.region(), true) {
            Err(Error::EpochNotMatch(m, mut new_regions)) => {
                // Attach the next region which might be split from the
                // current region. Even when it is not, the client's cache
                // is only refreshed if the attached meta is newer.
                if let Some(sibling) = self.find_sibling_region() {
                    new_regions.push(sibling);
                }
                Err(Error::EpochNotMatch(m, new_regions))
            }
            other => other,
        }
    }

    fn propose_raft_command(&mut self, msg: RaftCmdRequest, cb: Callback<EK>) {
        if let Err(e) = self.pre_propose_raft_command(&msg) {
            cb.invoke_with_response(cmd_resp::new_error(e));
            return;
        }

        if self.fsm.peer.pending_remove {
            apply::notify_req_region_removed(self.region_id(), cb);
            return;
        }

        // The peer checked out as leader above. It might step down later,
        // but then the proposed entry simply cannot be committed.
        let mut resp = RaftCmdResponse::default();
        let term = self.fsm.peer.term();
        cmd_resp::bind_term(&mut resp, term);
        self.fsm.peer.propose(self.ctx, cb, msg, resp);
    }

    /// The region immediately to the right in the range index.
    fn find_sibling_region(&self) -> Option<Region> {
        let meta = self.ctx.store_meta.lock().unwrap();
        meta.region_ranges
            .range((Excluded(enc_end_key(self.region())), Unbounded))
            .next()
            .map(|(_, region_id)| meta.regions[region_id].clone())
    }

    fn on_prepare_split_region(
        &mut self,
        region_epoch: RegionEpoch,
        split_keys: Vec<Vec<u8>>,
        cb: Callback<EK>,
    ) {
        if let Err(e) = self.validate_split_region(&region_epoch, &split_keys) {
            cb.invoke_with_response(cmd_resp::new_error(e));
            return;
        }
        let region = self.region().clone();
        let task = PdTask::AskBatchSplit {
            region,
            split_keys,
            peer: self.fsm.peer.peer,
            callback: cb,
        };
        if let Err(e) = self.ctx.pd_scheduler.schedule(task) {
            error!(self.logger(), "failed to notify pd to split"; "err" => %e);
            if let PdTask::AskBatchSplit { callback, .. } = e.into_inner() {
                callback.invoke_with_response(cmd_resp::new_error(Error::Other(
                    "failed to split: scheduler stopped".into(),
                )));
            }
        }
    }

    fn validate_split_region(
        &self,
        epoch: &RegionEpoch,
        split_keys: &[Vec<u8>],
    ) -> Result<()> {
        if split_keys.is_empty() {
            error!(self.logger(), "no split key is specified");
            return Err(Error::Other(kestrel_util::box_err!(
                "{} no split key is specified",
                self.fsm.peer.tag
            )));
        }
        for key in split_keys {
            if key.is_empty() {
                error!(self.logger(), "split key should not be empty");
                return Err(Error::Other(kestrel_util::box_err!(
                    "{} split key should not be empty",
                    self.fsm.peer.tag
                )));
            }
        }
        if !self.fsm.peer.is_leader() {
            // The region on this store is no longer leader, skipped.
            info!(self.logger(), "not leader, skip");
            return Err(Error::NotLeader(
                self.region_id(),
                self.fsm.peer.get_peer_from_cache(self.fsm.peer.leader_id()),
            ));
        }

        let region = self.region();
        let latest_epoch = region.region_epoch;

        // This differs from the epoch check of a regular command: only the
        // version matters, conf_ver is refreshed when the split is sent to
        // the driver.
        if latest_epoch.version != epoch.version {
            info!(
                self.logger(),
                "epoch changed, retry later";
                "prev_epoch" => ?latest_epoch,
                "epoch" => ?epoch,
            );
            return Err(Error::EpochNotMatch(
                format!(
                    "{} epoch changed {:?} != {:?}, retry later",
                    self.fsm.peer.tag, latest_epoch, epoch
                ),
                vec![region.clone()],
            ));
        }
        Ok(())
    }
}

/// Answers a stale sender. A stale vote gets a tombstone addressed back to
/// it (the sender is gone from the region and must gc itself); anything
/// else is dropped quietly.
pub fn handle_stale_msg<T: Transport>(
    trans: &T,
    msg: &RaftMessage,
    cur_epoch: RegionEpoch,
    need_gc: bool,
    logger: &Logger,
) {
    let region_id = msg.region_id;
    if !need_gc {
        info!(
            logger,
            "raft message is stale, ignore it";
            "region_id" => region_id,
            "current_epoch" => ?cur_epoch,
        );
        return;
    }
    let gc_msg = RaftMessage {
        region_id,
        from_peer: msg.to_peer,
        to_peer: msg.from_peer,
        region_epoch: Some(cur_epoch),
        is_tombstone: true,
        ..Default::default()
    };
    if let Err(e) = trans.send(gc_msg) {
        error!(
            logger,
            "send gc message failed";
            "region_id" => region_id,
            "err" => %e,
        );
    }
}

fn new_admin_request(region_id: u64, peer: metapb::Peer) -> RaftCmdRequest {
    RaftCmdRequest {
        header: RaftRequestHeader {
            region_id,
            peer,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn new_compact_log_request(
    region_id: u64,
    peer: metapb::Peer,
    compact_index: u64,
    compact_term: u64,
) -> RaftCmdRequest {
    let mut request = new_admin_request(region_id, peer);
    request.admin_request = Some(AdminRequest::CompactLog(CompactLogRequest {
        compact_index,
        compact_term,
    }));
    request
}
