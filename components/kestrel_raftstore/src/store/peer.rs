// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::time::Instant;

use kestrel_engine::{Engines, KvEngine};
use kestrel_proto::metapb;
use kestrel_proto::raft_cmdpb::{AdminRequest, RaftCmdRequest, RaftCmdResponse};
use kestrel_proto::raft_serverpb::{PeerState, RaftMessage};
use kestrel_util::worker::Scheduler;
use raft::eraftpb::{self, ConfChange};
use raft::{RawNode, StateRole, INVALID_ID};
use slog::{debug, error, info, o, warn, Logger};

use crate::store::cmd_resp;
use crate::store::config::Config;
use crate::store::fsm::apply::{Apply, ApplyMsg, ApplyRes, Proposal, RegionProposal, Registration};
use crate::store::fsm::StoreContext;
use crate::store::msg::Callback;
use crate::store::peer_storage::{ApplySnapResult, PeerStorage, write_peer_state};
use crate::store::transport::Transport;
use crate::store::worker::{PdTask, RegionTask};
use crate::{Error, Result};

/// A replica of one region on this store.
///
/// Owns the raft state machine, the pending proposals whose callbacks are
/// still outstanding, and the bookkeeping the leader needs to watch its
/// followers (heartbeats, catch-up progress, size hints).
pub struct Peer<EK: KvEngine> {
    pub peer: metapb::Peer,
    region_id: u64,
    pub raft_group: RawNode<PeerStorage<EK>>,
    /// Peer metadata for routing outbound messages, filled from received
    /// messages and membership changes.
    peer_cache: HashMap<u64, metapb::Peer>,
    /// Last heartbeat instants of other peers, leader only.
    pub peer_heartbeats: HashMap<u64, Instant>,
    /// Peers added by conf change that have not caught up yet, leader
    /// only.
    pub peers_start_pending_time: Vec<(u64, Instant)>,

    /// Approximate bytes written since the last split check.
    pub size_diff_hint: u64,
    /// Approximate region size as reported by the split checker; `None`
    /// until the first scan (or after a split invalidated it).
    pub approximate_size: Option<u64>,
    /// End of the last raft-log GC range handed to the GC worker.
    pub last_compacted_idx: u64,

    /// The peer is queued for destruction and must not handle new
    /// messages or proposals.
    pub pending_remove: bool,

    /// Proposals not yet handed to the apply pipeline.
    apply_proposals: Vec<Proposal<EK>>,

    pub tag: String,
    pub logger: Logger,
}

impl<EK: KvEngine> Peer<EK> {
    pub fn new(
        cfg: &Config,
        region_scheduler: Scheduler<RegionTask>,
        engines: Engines<EK>,
        region: &metapb::Region,
        peer: metapb::Peer,
        logger: &Logger,
    ) -> Result<Peer<EK>> {
        if peer.id == INVALID_ID {
            return Err(Error::Other("invalid peer id".into()));
        }
        let tag = format!("[region {}] {}", region.id, peer.id);
        let ps = PeerStorage::new(engines, region, region_scheduler, peer.id, tag.clone())?;
        let applied_index = ps.applied_index();

        let raft_cfg = raft::Config {
            id: peer.id,
            election_tick: cfg.raft_election_timeout_ticks,
            heartbeat_tick: cfg.raft_heartbeat_ticks,
            max_size_per_msg: cfg.raft_max_size_per_msg.0,
            max_inflight_msgs: cfg.raft_max_inflight_msgs,
            applied: applied_index,
            check_quorum: true,
            ..Default::default()
        };
        let logger = logger.new(o!("region_id" => region.id, "peer_id" => peer.id));
        let raft_group = RawNode::new(&raft_cfg, ps, &logger)?;

        Ok(Peer {
            peer,
            region_id: region.id,
            raft_group,
            peer_cache: HashMap::new(),
            peer_heartbeats: HashMap::new(),
            peers_start_pending_time: Vec::new(),
            size_diff_hint: 0,
            approximate_size: None,
            last_compacted_idx: 0,
            pending_remove: false,
            apply_proposals: Vec::new(),
            tag,
            logger,
        })
    }

    #[inline]
    pub fn get_store(&self) -> &PeerStorage<EK> {
        self.raft_group.store()
    }

    #[inline]
    pub fn mut_store(&mut self) -> &mut PeerStorage<EK> {
        self.raft_group.mut_store()
    }

    #[inline]
    pub fn region(&self) -> &metapb::Region {
        self.get_store().region()
    }

    pub fn set_region(&mut self, region: metapb::Region) {
        self.mut_store().set_region(region);
    }

    #[inline]
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    #[inline]
    pub fn peer_id(&self) -> u64 {
        self.peer.id
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.raft_group.raft.state == StateRole::Leader
    }

    #[inline]
    pub fn leader_id(&self) -> u64 {
        self.raft_group.raft.leader_id
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.raft_group.raft.term
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.get_store().is_initialized()
    }

    #[inline]
    pub fn is_applying_snapshot(&self) -> bool {
        self.get_store().is_applying_snapshot()
    }

    /// Raft accepted a snapshot that is not installed yet.
    #[inline]
    pub fn has_pending_snapshot(&self) -> bool {
        self.raft_group.raft.raft_log.unstable.snapshot.is_some()
    }

    pub fn step(&mut self, msg: eraftpb::Message) -> Result<()> {
        self.raft_group.step(msg)?;
        Ok(())
    }

    pub fn insert_peer_cache(&mut self, peer: metapb::Peer) {
        self.peer_cache.insert(peer.id, peer);
    }

    pub fn remove_peer_from_cache(&mut self, peer_id: u64) {
        self.peer_cache.remove(&peer_id);
    }

    pub fn get_peer_from_cache(&self, peer_id: u64) -> Option<metapb::Peer> {
        if let Some(peer) = self.peer_cache.get(&peer_id) {
            return Some(*peer);
        }
        self.region().peers.iter().find(|p| p.id == peer_id).copied()
    }

    #[inline]
    fn next_proposal_index(&self) -> u64 {
        self.raft_group.raft.raft_log.last_index() + 1
    }

    /// A peer may be destroyed at any point except while a snapshot is
    /// being installed; interrupting that would leave engine state that
    /// belongs to no peer.
    pub fn maybe_destroy(&self) -> bool {
        if self.is_applying_snapshot() {
            info!(
                self.logger,
                "stale peer is applying snapshot, will destroy next time";
            );
            return false;
        }
        true
    }

    /// Atomic engine-level wipe: raft log, raft/apply state, region state
    /// flipped to tombstone, then data. Outstanding proposals answer
    /// `RegionRemoved`.
    pub fn destroy(&mut self) -> Result<()> {
        let t = Instant::now();
        let region = self.region().clone();
        info!(self.logger, "begin to destroy");

        let engines = self.get_store().engines.clone();
        let mut kv_wb = engines.kv.write_batch();
        let mut raft_wb = engines.raft.write_batch();
        self.get_store().clear_meta(&mut kv_wb, &mut raft_wb)?;
        write_peer_state(&mut kv_wb, &region, PeerState::Tombstone)?;
        // The tombstone must land before the raft metadata disappears, or
        // a restart could recreate the peer from a half-erased state.
        engines.write_kv(&kv_wb)?;
        engines.write_raft(&raft_wb)?;

        if self.get_store().is_initialized() {
            self.get_store().clear_data()?;
        }

        for proposal in self.apply_proposals.drain(..) {
            crate::store::fsm::apply::notify_req_region_removed(region.id, proposal.cb);
        }

        info!(
            self.logger,
            "peer destroyed itself";
            "takes" => ?t.elapsed(),
        );
        Ok(())
    }

    /// New split peers campaign immediately when their parent was the
    /// leader, so the fresh region does not sit leaderless for a full
    /// election timeout.
    pub fn maybe_campaign(&mut self, parent_is_leader: bool) -> bool {
        if self.region().peers.len() <= 1 {
            // The peer campaigns when it starts anyway.
            return false;
        }
        if !parent_is_leader {
            return false;
        }
        if let Err(e) = self.raft_group.campaign() {
            warn!(self.logger, "failed to campaign"; "err" => %e);
            return false;
        }
        true
    }

    /// Peers that were added but whose log is still behind the truncated
    /// index; reported to the placement driver so it can delay further
    /// conf changes.
    pub fn collect_pending_peers(&self) -> Vec<metapb::Peer> {
        let mut pending = Vec::new();
        let truncated_idx = self.get_store().truncated_index();
        for p in &self.region().peers {
            if p.id == self.peer.id {
                continue;
            }
            if let Some(progress) = self.raft_group.raft.prs().get(p.id) {
                if progress.matched < truncated_idx {
                    pending.push(*p);
                }
            }
        }
        pending
    }

    /// Drops leader-only bookkeeping for peers that left the region.
    pub fn check_peers(&mut self) {
        if !self.is_leader() {
            self.peer_heartbeats.clear();
            self.peers_start_pending_time.clear();
            return;
        }
        if self.peer_heartbeats.len() == self.region().peers.len() {
            return;
        }
        let region = self.region().clone();
        for peer in &region.peers {
            self.peer_heartbeats
                .entry(peer.id)
                .or_insert_with(Instant::now);
        }
        let peer_ids: Vec<u64> = region.peers.iter().map(|p| p.id).collect();
        self.peer_heartbeats.retain(|id, _| peer_ids.contains(id));
    }

    /// True the first time a newly added peer catches up with the leader's
    /// log; the caller reacts by heartbeating the placement driver so the
    /// conf change can complete promptly.
    pub fn any_new_peer_catch_up(&mut self, peer_id: u64) -> bool {
        if self.peers_start_pending_time.is_empty() {
            return false;
        }
        if !self.is_leader() {
            self.peers_start_pending_time.clear();
            return false;
        }
        let truncated_idx = self.get_store().truncated_index();
        let pos = self
            .peers_start_pending_time
            .iter()
            .position(|&(id, _)| id == peer_id);
        if let Some(pos) = pos {
            if let Some(progress) = self.raft_group.raft.prs().get(peer_id) {
                if progress.matched >= truncated_idx {
                    let (_, pending_after) = self.peers_start_pending_time.swap_remove(pos);
                    debug!(
                        self.logger,
                        "peer has caught up logs";
                        "takes" => ?pending_after.elapsed(),
                        "caught_up_peer_id" => peer_id,
                    );
                    return true;
                }
            }
        }
        false
    }

    pub fn heartbeat_pd<T: Transport>(&self, ctx: &StoreContext<EK, T>) {
        let task = PdTask::Heartbeat {
            region: self.region().clone(),
            peer: self.peer,
            pending_peers: self.collect_pending_peers(),
            approximate_size: self.approximate_size.unwrap_or(0),
        };
        if let Err(e) = ctx.pd_scheduler.schedule(task) {
            error!(self.logger, "failed to notify pd"; "err" => %e);
        }
    }

    pub fn registration(&self) -> Registration {
        let store = self.get_store();
        Registration {
            id: self.peer.id,
            term: self.term(),
            apply_state: store.apply_state,
            applied_index_term: store.applied_index_term,
            region: self.region().clone(),
        }
    }

    /// Proposes a client command. Returns true when a proposal entered the
    /// raft log; the callback is then parked until the entry applies.
    pub fn propose<T: Transport>(
        &mut self,
        ctx: &StoreContext<EK, T>,
        cb: Callback<EK>,
        req: RaftCmdRequest,
        mut err_resp: RaftCmdResponse,
    ) -> bool {
        let is_conf_change = matches!(req.admin_request, Some(AdminRequest::ChangePeer(_)));
        let res = if is_conf_change {
            self.propose_conf_change(&req)
        } else {
            self.propose_normal(&ctx.cfg, &req)
        };
        match res {
            Err(e) => {
                debug!(self.logger, "failed to propose"; "err" => %e);
                cmd_resp::bind_error(&mut err_resp, e);
                cb.invoke_with_response(err_resp);
                false
            }
            Ok(propose_index) => {
                let proposal = Proposal {
                    is_conf_change,
                    index: propose_index,
                    term: self.term(),
                    cb,
                };
                self.apply_proposals.push(proposal);
                true
            }
        }
    }

    fn propose_normal(&mut self, cfg: &Config, req: &RaftCmdRequest) -> Result<u64> {
        let data = bincode::serialize(req)?;
        if data.len() as u64 > cfg.raft_entry_max_size.0 {
            error!(self.logger, "entry is too large"; "size" => data.len());
            return Err(Error::RaftEntryTooLarge(self.region_id, data.len() as u64));
        }
        let propose_index = self.next_proposal_index();
        self.raft_group.propose(vec![], data)?;
        if self.next_proposal_index() == propose_index {
            // The message is dropped silently, typically because the peer
            // lost leadership between the check and the proposal.
            return Err(Error::NotLeader(self.region_id, None));
        }
        Ok(propose_index)
    }

    fn propose_conf_change(&mut self, req: &RaftCmdRequest) -> Result<u64> {
        let raft = &self.raft_group.raft;
        if raft.pending_conf_index > self.get_store().applied_index() {
            info!(self.logger, "there is a pending conf change, try later");
            return Err(Error::Other(kestrel_util::box_err!(
                "{} there is a pending conf change, try later",
                self.tag
            )));
        }
        let change_peer = match &req.admin_request {
            Some(AdminRequest::ChangePeer(cp)) => cp,
            _ => unreachable!(),
        };
        let data = bincode::serialize(req)?;
        let mut cc = ConfChange::default();
        cc.set_change_type(change_peer.change_type.into());
        cc.set_node_id(change_peer.peer.id);
        cc.set_context(data.into());

        info!(
            self.logger,
            "propose conf change peer";
            "change_type" => ?change_peer.change_type,
            "change_peer" => ?change_peer.peer,
        );

        let propose_index = self.next_proposal_index();
        self.raft_group.propose_conf_change(vec![], cc)?;
        if self.next_proposal_index() == propose_index {
            return Err(Error::NotLeader(self.region_id, None));
        }
        Ok(propose_index)
    }

    fn send_raft_messages<T: Transport>(
        &mut self,
        ctx: &StoreContext<EK, T>,
        msgs: Vec<eraftpb::Message>,
    ) {
        for msg in msgs {
            let msg_type = msg.get_msg_type();
            let to_peer = match self.get_peer_from_cache(msg.get_to()) {
                Some(p) => p,
                None => {
                    warn!(
                        self.logger,
                        "failed to look up recipient peer";
                        "to_peer" => msg.get_to(),
                    );
                    continue;
                }
            };
            let send_msg = RaftMessage {
                region_id: self.region_id,
                from_peer: self.peer,
                to_peer,
                region_epoch: Some(self.region().region_epoch),
                message: msg,
                is_tombstone: false,
                // The receiving store may not host this peer yet; the
                // range lets it judge overlaps before creating one.
                start_key: self.region().start_key.clone(),
                end_key: self.region().end_key.clone(),
            };
            if let Err(e) = ctx.trans.send(send_msg) {
                // Dropping is fine, raft retransmits; stepping an error in
                // would only confuse the state machine.
                debug!(
                    self.logger,
                    "failed to send msg to other peer";
                    "target_peer" => to_peer.id,
                    "msg_type" => ?msg_type,
                    "err" => %e,
                );
            }
        }
    }

    /// Drains one ready batch: persists raft state, ships messages, and
    /// forwards committed entries to the apply pipeline. Returns the
    /// snapshot transition when one was installed.
    pub fn handle_raft_ready<T: Transport>(
        &mut self,
        ctx: &StoreContext<EK, T>,
    ) -> Option<ApplySnapResult> {
        if self.pending_remove {
            return None;
        }
        if !self.raft_group.has_ready() {
            return None;
        }

        let mut ready = self.raft_group.ready();

        if let Some(ss) = ready.ss() {
            if ss.raft_state == StateRole::Leader {
                self.heartbeat_pd(ctx);
            }
        }

        // Leader messages may go out before persistence; answers that
        // could advance another peer's commit wait behind the batch.
        self.send_raft_messages(ctx, ready.take_messages());

        let apply_snap_result = self
            .mut_store()
            .handle_raft_ready(&mut ready)
            .unwrap_or_else(|e| panic!("{} failed to handle raft ready: {:?}", self.tag, e));

        self.send_raft_messages(ctx, ready.take_persisted_messages());

        if apply_snap_result.is_some() {
            // The snapshot rewrote the region; the apply pipeline needs a
            // fresh delegate before anything else touches it.
            ctx.apply_router
                .schedule(ApplyMsg::Registration(self.registration()));
        }

        if !self.apply_proposals.is_empty() {
            let props = std::mem::take(&mut self.apply_proposals);
            ctx.apply_router.schedule(ApplyMsg::Proposal(RegionProposal {
                id: self.peer.id,
                region_id: self.region_id,
                props,
            }));
        }

        let committed_entries = ready.take_committed_entries();
        if !committed_entries.is_empty() {
            ctx.apply_router.schedule(ApplyMsg::Apply(Apply {
                region_id: self.region_id,
                term: self.term(),
                entries: committed_entries,
            }));
        }

        let mut light_rd = self.raft_group.advance_append(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.mut_store().raft_state.commit = commit;
        }
        self.send_raft_messages(ctx, light_rd.take_messages());
        let committed_entries = light_rd.take_committed_entries();
        if !committed_entries.is_empty() {
            ctx.apply_router.schedule(ApplyMsg::Apply(Apply {
                region_id: self.region_id,
                term: self.term(),
                entries: committed_entries,
            }));
        }

        if apply_snap_result.is_some() {
            // The snapshot data is already installed; move raft's applied
            // cursor onto it so the next committed entries line up.
            let applied_index = self.get_store().applied_index();
            self.raft_group.advance_apply_to(applied_index);
        }

        apply_snap_result
    }

    /// Folds an apply result back into raft: the applied index moves
    /// forward and raft may release the corresponding log memory.
    pub fn post_apply(&mut self, res: &ApplyRes) {
        let applied_index = res.apply_state.applied_index;
        self.raft_group.advance_apply_to(applied_index);
        let store = self.mut_store();
        store.apply_state = res.apply_state;
        store.applied_index_term = res.applied_index_term;
    }

    /// Sends a transfer-leader directive to raft. The transferee must be
    /// caught up; raft enforces that on its own.
    pub fn transfer_leader(&mut self, peer: &metapb::Peer) {
        info!(self.logger, "transfer leader"; "peer" => ?peer);
        self.raft_group.transfer_leader(peer.id);
    }
}
