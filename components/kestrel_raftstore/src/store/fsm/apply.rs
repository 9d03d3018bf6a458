// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! The apply pipeline.
//!
//! Apply workers consume batches of committed entries, execute them
//! against the kv engine, and feed the results back to the peer workers.
//! Every batch commits through a single engine write that also carries the
//! updated apply state, so crash recovery never replays an entry twice.
//! Admin commands surface their side effects as [`ExecResult`]s; the peer
//! message handler folds those into raft and the store topology.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug, Formatter};

use crossbeam::channel::Receiver;
use kestrel_engine::{Engines, KvEngine, Mutable, Peekable, WriteBatch};
use kestrel_proto::metapb::{self, Region};
use kestrel_proto::raft_cmdpb::{
    AdminRequest, AdminResponse, BatchSplitRequest, ChangePeerRequest, CompactLogRequest,
    ConfChangeKind, RaftCmdRequest, RaftCmdResponse, Request, Response, TransferLeaderRequest,
};
use kestrel_proto::raft_serverpb::{PeerState, RaftApplyState, RaftTruncatedState};
use protobuf::Message;
use raft::eraftpb::{ConfChange, Entry, EntryType};
use slog::{debug, error, info, Logger};

use crate::keys;
use crate::store::cmd_resp;
use crate::store::msg::{Callback, PeerMsg};
use crate::store::peer_storage::{self, write_initial_apply_state, write_peer_state};
use crate::store::region_snapshot::RegionSnapshot;
use crate::store::router::Router;
use crate::store::util;
use crate::{Error, Result};

const SHRINK_PENDING_CMD_QUEUE_CAP: usize = 64;

pub struct PendingCmd<EK: KvEngine> {
    pub index: u64,
    pub term: u64,
    pub cb: Option<Callback<EK>>,
}

impl<EK: KvEngine> PendingCmd<EK> {
    fn new(index: u64, term: u64, cb: Callback<EK>) -> PendingCmd<EK> {
        PendingCmd {
            index,
            term,
            cb: Some(cb),
        }
    }
}

impl<EK: KvEngine> Drop for PendingCmd<EK> {
    fn drop(&mut self) {
        if self.cb.is_some() {
            panic!(
                "callback of pending command at [index: {}, term: {}] is leak",
                self.index, self.term
            );
        }
    }
}

impl<EK: KvEngine> Debug for PendingCmd<EK> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PendingCmd [index: {}, term: {}, has_cb: {}]",
            self.index,
            self.term,
            self.cb.is_some()
        )
    }
}

/// Commands waiting to be committed and applied.
pub struct PendingCmdQueue<EK: KvEngine> {
    normals: VecDeque<PendingCmd<EK>>,
    conf_change: Option<PendingCmd<EK>>,
}

impl<EK: KvEngine> Default for PendingCmdQueue<EK> {
    fn default() -> PendingCmdQueue<EK> {
        PendingCmdQueue {
            normals: VecDeque::new(),
            conf_change: None,
        }
    }
}

impl<EK: KvEngine> PendingCmdQueue<EK> {
    fn pop_normal(&mut self, index: u64, term: u64) -> Option<PendingCmd<EK>> {
        self.normals.pop_front().and_then(|cmd| {
            if self.normals.capacity() > SHRINK_PENDING_CMD_QUEUE_CAP
                && self.normals.len() < SHRINK_PENDING_CMD_QUEUE_CAP
            {
                self.normals.shrink_to_fit();
            }
            if (cmd.term, cmd.index) > (term, index) {
                self.normals.push_front(cmd);
                return None;
            }
            Some(cmd)
        })
    }

    fn append_normal(&mut self, cmd: PendingCmd<EK>) {
        self.normals.push_back(cmd);
    }

    fn take_conf_change(&mut self) -> Option<PendingCmd<EK>> {
        // conf change will not be affected when changing between follower
        // and leader, so there is no need to check term.
        self.conf_change.take()
    }

    fn set_conf_change(&mut self, cmd: PendingCmd<EK>) {
        self.conf_change = Some(cmd);
    }
}

#[derive(Debug, Default)]
pub struct ChangePeer {
    pub conf_change: ConfChange,
    pub peer: metapb::Peer,
    pub region: Region,
}

#[derive(Debug)]
pub enum ExecResult {
    ChangePeer(ChangePeer),
    CompactLog {
        state: RaftTruncatedState,
        first_index: u64,
    },
    SplitRegion {
        regions: Vec<Region>,
        derived: Region,
    },
    TransferLeader {
        peer: metapb::Peer,
    },
}

/// The possible returned value when applying one log entry.
enum ApplyResult {
    None,
    Res(ExecResult),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyMetrics {
    /// Bytes the region grew (or shrank) by during this batch.
    pub size_diff_hint: i64,
    pub delete_keys_hint: u64,
    pub written_bytes: u64,
    pub written_keys: u64,
}

#[derive(Debug)]
pub struct ApplyRes {
    pub region_id: u64,
    pub apply_state: RaftApplyState,
    pub applied_index_term: u64,
    pub exec_res: VecDeque<ExecResult>,
    pub metrics: ApplyMetrics,
}

#[derive(Debug)]
pub enum TaskRes {
    Apply(ApplyRes),
    Destroy { region_id: u64, peer_id: u64 },
}

/// Committed entries of one region, tagged with the term the peer observed
/// when it handed them over.
pub struct Apply {
    pub region_id: u64,
    pub term: u64,
    pub entries: Vec<Entry>,
}

pub struct Proposal<EK: KvEngine> {
    pub is_conf_change: bool,
    pub index: u64,
    pub term: u64,
    pub cb: Callback<EK>,
}

pub struct RegionProposal<EK: KvEngine> {
    pub id: u64,
    pub region_id: u64,
    pub props: Vec<Proposal<EK>>,
}

#[derive(Debug)]
pub struct Registration {
    pub id: u64,
    pub term: u64,
    pub apply_state: RaftApplyState,
    pub applied_index_term: u64,
    pub region: Region,
}

pub enum ApplyMsg<EK: KvEngine> {
    Apply(Apply),
    Proposal(RegionProposal<EK>),
    /// (Re-)installs the delegate of a peer, used at peer creation and
    /// after a snapshot rewrites the region.
    Registration(Registration),
    Destroy {
        region_id: u64,
    },
}

impl<EK: KvEngine> Debug for ApplyMsg<EK> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMsg::Apply(a) => write!(
                f,
                "[region {}] async apply with {} entries",
                a.region_id,
                a.entries.len()
            ),
            ApplyMsg::Proposal(p) => {
                write!(f, "[region {}] {} region proposals", p.region_id, p.props.len())
            }
            ApplyMsg::Registration(r) => {
                write!(f, "[region {}] registration for peer {}", r.region.id, r.id)
            }
            ApplyMsg::Destroy { region_id } => write!(f, "[region {}] destroy", region_id),
        }
    }
}

impl<EK: KvEngine> ApplyMsg<EK> {
    fn region_id(&self) -> u64 {
        match self {
            ApplyMsg::Apply(a) => a.region_id,
            ApplyMsg::Proposal(p) => p.region_id,
            ApplyMsg::Registration(r) => r.region.id,
            ApplyMsg::Destroy { region_id } => *region_id,
        }
    }
}

pub(crate) enum ApplyTicket<EK: KvEngine> {
    Msg(ApplyMsg<EK>),
    Stop,
}

/// Routes apply messages to the worker owning the region. The channels are
/// unbounded: apply feedback must never deadlock against the bounded peer
/// mailboxes.
pub struct ApplyRouter<EK: KvEngine> {
    senders: std::sync::Arc<Vec<crossbeam::channel::Sender<ApplyTicket<EK>>>>,
}

impl<EK: KvEngine> Clone for ApplyRouter<EK> {
    fn clone(&self) -> ApplyRouter<EK> {
        ApplyRouter {
            senders: std::sync::Arc::clone(&self.senders),
        }
    }
}

impl<EK: KvEngine> ApplyRouter<EK> {
    pub(crate) fn new(
        senders: Vec<crossbeam::channel::Sender<ApplyTicket<EK>>>,
    ) -> ApplyRouter<EK> {
        ApplyRouter {
            senders: std::sync::Arc::new(senders),
        }
    }

    pub fn schedule(&self, msg: ApplyMsg<EK>) {
        let idx = (msg.region_id() % self.senders.len() as u64) as usize;
        // Failure means the store is shutting down; pending callbacks are
        // resolved by the peers' own teardown.
        let _ = self.senders[idx].send(ApplyTicket::Msg(msg));
    }

    pub(crate) fn shutdown(&self) {
        for sender in self.senders.iter() {
            let _ = sender.send(ApplyTicket::Stop);
        }
    }
}

fn notify_region_removed<EK: KvEngine>(region_id: u64, mut cmd: PendingCmd<EK>) {
    notify_req_region_removed(region_id, cmd.cb.take().unwrap());
}

pub fn notify_req_region_removed<EK: KvEngine>(region_id: u64, cb: Callback<EK>) {
    let resp = cmd_resp::new_error(Error::RegionRemoved(region_id));
    cb.invoke_with_response(resp);
}

fn notify_stale_command<EK: KvEngine>(term: u64, mut cmd: PendingCmd<EK>) {
    notify_stale_req(term, cmd.cb.take().unwrap());
}

pub fn notify_stale_req<EK: KvEngine>(term: u64, cb: Callback<EK>) {
    let resp = cmd_resp::err_resp(Error::StaleCommand, term);
    cb.invoke_with_response(resp);
}

struct ExecContext {
    apply_state: RaftApplyState,
    index: u64,
    term: u64,
}

/// Callback plus its finished response, queued until the batch commits.
struct ApplyCallback<EK: KvEngine> {
    cb: Option<Callback<EK>>,
    resp: RaftCmdResponse,
    snap: Option<RegionSnapshot<EK::Snapshot>>,
}

struct ApplyContext<EK: KvEngine> {
    engines: Engines<EK>,
    wb: EK::WriteBatch,
    cbs: Vec<ApplyCallback<EK>>,
    exec_ctx: Option<ExecContext>,
    logger: Logger,
}

impl<EK: KvEngine> ApplyContext<EK> {
    fn new(engines: Engines<EK>, logger: Logger) -> ApplyContext<EK> {
        let wb = engines.kv.write_batch();
        ApplyContext {
            engines,
            wb,
            cbs: Vec::new(),
            exec_ctx: None,
            logger,
        }
    }

    /// Flushes buffered mutations so a read executed mid-batch observes
    /// every prior write of the same batch.
    fn commit(&mut self) {
        if self.wb.is_empty() {
            return;
        }
        self.engines
            .write_kv(&self.wb)
            .unwrap_or_else(|e| panic!("failed to write to engine: {:?}", e));
        self.wb.clear();
    }

    /// Final write of the batch: data plus apply state atomically, then
    /// client callbacks in proposal order.
    fn finish_for(&mut self, delegate: &ApplyDelegate<EK>) {
        delegate.write_apply_state(&mut self.wb);
        self.engines
            .write_kv(&self.wb)
            .unwrap_or_else(|e| panic!("{} failed to write to engine: {:?}", delegate.tag, e));
        self.wb.clear();
        for queued in self.cbs.drain(..) {
            let ApplyCallback { cb, resp, snap } = queued;
            let cb = match cb {
                Some(cb) => cb,
                None => continue,
            };
            match snap {
                Some(snap) if matches!(&cb, Callback::Read(_)) => {
                    cb.invoke_read(crate::store::msg::ReadResponse {
                        response: resp,
                        snapshot: Some(snap),
                    });
                }
                _ => cb.invoke_with_response(resp),
            }
        }
    }
}

/// Executes committed entries for one region on an apply worker.
pub struct ApplyDelegate<EK: KvEngine> {
    id: u64,
    tag: String,
    region: Region,
    apply_state: RaftApplyState,
    applied_index_term: u64,
    /// Term carried by the latest apply batch, used to answer stale
    /// commands.
    term: u64,
    pending_cmds: PendingCmdQueue<EK>,
    stopped: bool,
    metrics: ApplyMetrics,
}

impl<EK: KvEngine> ApplyDelegate<EK> {
    fn from_registration(reg: Registration) -> ApplyDelegate<EK> {
        ApplyDelegate {
            tag: format!("[region {}] {}", reg.region.id, reg.id),
            id: reg.id,
            region: reg.region,
            apply_state: reg.apply_state,
            applied_index_term: reg.applied_index_term,
            term: reg.term,
            pending_cmds: PendingCmdQueue::default(),
            stopped: false,
            metrics: ApplyMetrics::default(),
        }
    }

    pub fn region_id(&self) -> u64 {
        self.region.id
    }

    fn write_apply_state(&self, wb: &mut EK::WriteBatch) {
        wb.put_msg(&keys::apply_state_key(self.region.id), &self.apply_state)
            .unwrap_or_else(|e| {
                panic!(
                    "{} failed to save apply state to write batch, error: {:?}",
                    self.tag, e
                );
            });
    }

    fn append_proposals(&mut self, props: Vec<Proposal<EK>>) {
        for p in props {
            let cmd = PendingCmd::new(p.index, p.term, p.cb);
            if p.is_conf_change {
                if let Some(cmd) = self.pending_cmds.take_conf_change() {
                    // A pending conf change can only be superseded by a
                    // newer one proposed after a leadership change.
                    notify_stale_command(self.term, cmd);
                }
                self.pending_cmds.set_conf_change(cmd);
            } else {
                self.pending_cmds.append_normal(cmd);
            }
        }
    }

    fn handle_raft_committed_entries(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        committed_entries: Vec<Entry>,
    ) -> VecDeque<ExecResult> {
        let mut results = VecDeque::new();
        for entry in committed_entries {
            if self.stopped {
                break;
            }
            let expected = self.apply_state.applied_index + 1;
            if entry.get_index() != expected {
                panic!(
                    "{} expect index {}, but got {}",
                    self.tag,
                    expected,
                    entry.get_index()
                );
            }
            let res = match entry.get_entry_type() {
                EntryType::EntryNormal => self.handle_raft_entry_normal(ctx, &entry),
                EntryType::EntryConfChange => self.handle_raft_entry_conf_change(ctx, &entry),
                EntryType::EntryConfChangeV2 => {
                    panic!("{} unexpected conf change v2 entry", self.tag)
                }
            };
            if let ApplyResult::Res(res) = res {
                results.push_back(res);
            }
        }
        results
    }

    fn handle_raft_entry_normal(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        entry: &Entry,
    ) -> ApplyResult {
        let index = entry.get_index();
        let term = entry.get_term();
        let data = entry.get_data();

        if !data.is_empty() {
            let cmd: RaftCmdRequest = match bincode::deserialize(data) {
                Ok(cmd) => cmd,
                Err(e) => panic!("{} failed to decode entry at {}: {:?}", self.tag, index, e),
            };
            return self.process_raft_cmd(ctx, index, term, cmd);
        }

        // An empty entry is proposed when a peer becomes leader. It still
        // advances the applied index and invalidates commands from older
        // terms.
        self.apply_state.applied_index = index;
        self.applied_index_term = term;
        assert!(term > 0);
        while let Some(cmd) = self.pending_cmds.pop_normal(u64::MAX, term - 1) {
            notify_stale_command(self.term, cmd);
        }
        ApplyResult::None
    }

    fn handle_raft_entry_conf_change(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        entry: &Entry,
    ) -> ApplyResult {
        let index = entry.get_index();
        let term = entry.get_term();
        let mut conf_change = ConfChange::default();
        conf_change
            .merge_from_bytes(entry.get_data())
            .unwrap_or_else(|e| panic!("{} invalid conf change at {}: {:?}", self.tag, index, e));
        let cmd: RaftCmdRequest = match bincode::deserialize(conf_change.get_context()) {
            Ok(cmd) => cmd,
            Err(e) => panic!("{} failed to decode conf change at {}: {:?}", self.tag, index, e),
        };
        match self.process_raft_cmd(ctx, index, term, cmd) {
            ApplyResult::None => {
                // The command was rejected (typically a stale epoch); tell
                // raft the conf change was aborted with an empty marker.
                ApplyResult::Res(ExecResult::ChangePeer(Default::default()))
            }
            ApplyResult::Res(mut res) => {
                if let ExecResult::ChangePeer(ref mut cp) = res {
                    cp.conf_change = conf_change;
                } else {
                    panic!(
                        "{} unexpected result {:?} for conf change at {}",
                        self.tag, res, index
                    );
                }
                ApplyResult::Res(res)
            }
        }
    }

    fn find_pending(&mut self, index: u64, term: u64, is_conf_change: bool) -> Option<Callback<EK>> {
        if is_conf_change {
            if let Some(mut cmd) = self.pending_cmds.take_conf_change() {
                if cmd.index == index && cmd.term == term {
                    return Some(cmd.cb.take().unwrap());
                }
                notify_stale_command(self.term, cmd);
            }
            return None;
        }
        while let Some(mut head) = self.pending_cmds.pop_normal(index, term) {
            if head.term == term {
                if head.index == index {
                    return Some(head.cb.take().unwrap());
                }
                panic!(
                    "{} unexpected callback at term {}, found index {}, expected {}",
                    self.tag, term, head.index, index
                );
            }
            // Proposed under an older term and superseded on this index.
            notify_stale_command(self.term, head);
        }
        None
    }

    fn process_raft_cmd(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        index: u64,
        term: u64,
        cmd: RaftCmdRequest,
    ) -> ApplyResult {
        if index == 0 {
            panic!("{} processing raft command needs a none zero index", self.tag);
        }
        let is_conf_change = matches!(cmd.admin_request, Some(AdminRequest::ChangePeer(_)));
        let (mut resp, snap, exec_result) = self.apply_raft_cmd(ctx, index, term, &cmd);

        debug!(
            ctx.logger,
            "applied command";
            "region_id" => self.region.id,
            "peer_id" => self.id,
            "index" => index,
        );

        cmd_resp::bind_term(&mut resp, self.term);
        let cmd_cb = self.find_pending(index, term, is_conf_change);
        ctx.cbs.push(ApplyCallback {
            cb: cmd_cb,
            resp,
            snap,
        });
        exec_result
    }

    /// Applies one raft command.
    ///
    /// An error here is one that occurs deterministically on every store
    /// (epoch mismatch, key out of range), so it is answered to the client
    /// and the entry still advances the applied index.
    fn apply_raft_cmd(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        index: u64,
        term: u64,
        req: &RaftCmdRequest,
    ) -> (RaftCmdResponse, Option<RegionSnapshot<EK::Snapshot>>, ApplyResult) {
        ctx.exec_ctx = Some(ExecContext {
            apply_state: self.apply_state,
            index,
            term,
        });
        ctx.wb.set_save_point();
        let (resp, snap, exec_result) = match self.exec_raft_cmd(ctx, req) {
            Ok((resp, snap, res)) => {
                ctx.wb.pop_save_point().unwrap();
                (resp, snap, res)
            }
            Err(e) => {
                ctx.wb.rollback_to_save_point().unwrap();
                match e {
                    Error::EpochNotMatch(..) => debug!(
                        ctx.logger,
                        "epoch not match";
                        "region_id" => self.region.id,
                        "err" => %e,
                    ),
                    _ => error!(
                        ctx.logger,
                        "execute raft command";
                        "region_id" => self.region.id,
                        "peer_id" => self.id,
                        "err" => %e,
                    ),
                }
                (cmd_resp::new_error(e), None, ApplyResult::None)
            }
        };

        let mut exec_ctx = ctx.exec_ctx.take().unwrap();
        exec_ctx.apply_state.applied_index = index;
        self.apply_state = exec_ctx.apply_state;
        self.applied_index_term = term;

        if let ApplyResult::Res(ref exec_result) = exec_result {
            match *exec_result {
                ExecResult::ChangePeer(ref cp) => {
                    self.region = cp.region.clone();
                }
                ExecResult::SplitRegion { ref derived, .. } => {
                    self.region = derived.clone();
                    self.metrics.size_diff_hint = 0;
                    self.metrics.delete_keys_hint = 0;
                }
                ExecResult::CompactLog { .. } | ExecResult::TransferLeader { .. } => {}
            }
        }

        (resp, snap, exec_result)
    }

    fn exec_raft_cmd(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        req: &RaftCmdRequest,
    ) -> Result<(RaftCmdResponse, Option<RegionSnapshot<EK::Snapshot>>, ApplyResult)> {
        // Only errors that also occur on all other stores may be returned.
        util::check_region_epoch(req, &self.region, false)?;
        match &req.admin_request {
            Some(admin) => {
                let (admin_resp, exec_result) = self.exec_admin_cmd(ctx, admin)?;
                let resp = RaftCmdResponse {
                    admin_response: Some(admin_resp),
                    ..Default::default()
                };
                Ok((resp, None, exec_result))
            }
            None => self.exec_write_cmd(ctx, &req.requests),
        }
    }

    fn exec_admin_cmd(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        req: &AdminRequest,
    ) -> Result<(AdminResponse, ApplyResult)> {
        info!(
            ctx.logger,
            "execute admin command";
            "region_id" => self.region.id,
            "peer_id" => self.id,
            "term" => ctx.exec_ctx.as_ref().unwrap().term,
            "index" => ctx.exec_ctx.as_ref().unwrap().index,
            "command" => ?req.cmd_type(),
        );
        match req {
            AdminRequest::ChangePeer(cp) => self.exec_change_peer(ctx, cp),
            AdminRequest::CompactLog(c) => self.exec_compact_log(ctx, c),
            AdminRequest::Splits(s) => self.exec_batch_split(ctx, s),
            AdminRequest::TransferLeader(t) => self.exec_transfer_leader(t),
        }
    }

    fn exec_change_peer(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        request: &ChangePeerRequest,
    ) -> Result<(AdminResponse, ApplyResult)> {
        let peer = request.peer;
        let mut region = self.region.clone();

        match request.change_type {
            ConfChangeKind::AddNode => {
                if util::find_peer(&region, peer.store_id).is_some() {
                    return Err(Error::Other(kestrel_util::box_err!(
                        "{} can't add duplicated peer {:?} to region {:?}",
                        self.tag,
                        peer,
                        region
                    )));
                }
                region.peers.push(peer);
            }
            ConfChangeKind::RemoveNode => {
                match util::remove_peer(&mut region, peer.store_id) {
                    Some(p) if p.id == peer.id => {}
                    other => {
                        return Err(Error::Other(kestrel_util::box_err!(
                            "{} remove missing peer {:?} from region {:?}, found {:?}",
                            self.tag,
                            peer,
                            self.region,
                            other
                        )));
                    }
                }
            }
        }
        region.region_epoch.conf_ver += 1;

        info!(
            ctx.logger,
            "conf change applied";
            "region_id" => self.region.id,
            "peer_id" => self.id,
            "change_type" => ?request.change_type,
            "target_peer" => ?peer,
            "region" => ?region,
        );
        write_peer_state(&mut ctx.wb, &region, PeerState::Normal)?;

        let resp = AdminResponse::ChangePeer {
            region: region.clone(),
        };
        Ok((
            resp,
            ApplyResult::Res(ExecResult::ChangePeer(ChangePeer {
                // The raft-level conf change is attached by the entry
                // decoder.
                conf_change: Default::default(),
                peer,
                region,
            })),
        ))
    }

    fn exec_compact_log(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        req: &CompactLogRequest,
    ) -> Result<(AdminResponse, ApplyResult)> {
        let compact_index = req.compact_index;
        let resp = AdminResponse::CompactLog;
        let exec_ctx = ctx.exec_ctx.as_mut().unwrap();
        let first_index = peer_storage::first_index(&exec_ctx.apply_state);
        if compact_index <= first_index - 1 {
            debug!(
                ctx.logger,
                "compact index not greater than first index, no need to compact";
                "region_id" => self.region.id,
                "compact_index" => compact_index,
                "first_index" => first_index,
            );
            return Ok((resp, ApplyResult::None));
        }
        if compact_index > exec_ctx.apply_state.applied_index {
            return Err(Error::Other(kestrel_util::box_err!(
                "{} compact index {} > applied index {}",
                self.tag,
                compact_index,
                exec_ctx.apply_state.applied_index
            )));
        }
        if req.compact_term == 0 {
            return Err(Error::Other(kestrel_util::box_err!(
                "{} compact term missing, skip",
                self.tag
            )));
        }
        exec_ctx.apply_state.truncated_state = RaftTruncatedState {
            index: compact_index,
            term: req.compact_term,
        };
        Ok((
            resp,
            ApplyResult::Res(ExecResult::CompactLog {
                state: exec_ctx.apply_state.truncated_state,
                first_index,
            }),
        ))
    }

    fn exec_batch_split(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        split_reqs: &BatchSplitRequest,
    ) -> Result<(AdminResponse, ApplyResult)> {
        if split_reqs.requests.is_empty() {
            return Err(Error::Other("missing split requests".into()));
        }
        let mut derived = self.region.clone();
        let new_region_cnt = split_reqs.requests.len();
        let mut regions = Vec::with_capacity(new_region_cnt + 1);
        let mut keys_queue: VecDeque<Vec<u8>> = VecDeque::with_capacity(new_region_cnt + 1);
        for req in &split_reqs.requests {
            let split_key = &req.split_key;
            if split_key.is_empty() {
                return Err(Error::Other("missing split key".into()));
            }
            if split_key
                <= keys_queue
                    .back()
                    .unwrap_or(&derived.start_key)
            {
                return Err(Error::Other(kestrel_util::box_err!(
                    "invalid split request: {:?}",
                    split_reqs
                )));
            }
            if req.new_peer_ids.len() != derived.peers.len() {
                return Err(Error::Other(kestrel_util::box_err!(
                    "invalid new peer id count, need {}, but got {}",
                    derived.peers.len(),
                    req.new_peer_ids.len()
                )));
            }
            keys_queue.push_back(split_key.to_vec());
        }
        util::check_key_in_region(keys_queue.back().unwrap(), &self.region)?;

        info!(
            ctx.logger,
            "split region";
            "region_id" => self.region.id,
            "peer_id" => self.id,
            "region" => ?derived,
            "keys" => %util::KeysInfoFormatter(keys_queue.iter()),
        );

        let new_version = derived.region_epoch.version + new_region_cnt as u64;
        derived.region_epoch.version = new_version;
        // The parent keeps its id and start key; every split key starts a
        // new region to its right.
        keys_queue.push_back(derived.end_key.clone());
        derived.end_key = keys_queue.front().unwrap().to_vec();
        regions.push(derived.clone());
        for req in &split_reqs.requests {
            let mut new_region = Region {
                id: req.new_region_id,
                region_epoch: derived.region_epoch,
                start_key: keys_queue.pop_front().unwrap(),
                ..Default::default()
            };
            new_region.end_key = keys_queue.front().unwrap().to_vec();
            for (peer, &peer_id) in derived.peers.iter().zip(&req.new_peer_ids) {
                new_region.peers.push(metapb::Peer {
                    id: peer_id,
                    store_id: peer.store_id,
                });
            }
            regions.push(new_region);
        }

        for new_region in &regions {
            if new_region.id == derived.id {
                continue;
            }
            write_peer_state(&mut ctx.wb, new_region, PeerState::Normal)?;
            write_initial_apply_state(&mut ctx.wb, new_region.id)?;
        }
        write_peer_state(&mut ctx.wb, &derived, PeerState::Normal)?;

        let resp = AdminResponse::Splits {
            regions: regions.clone(),
        };
        Ok((
            resp,
            ApplyResult::Res(ExecResult::SplitRegion { regions, derived }),
        ))
    }

    fn exec_transfer_leader(
        &mut self,
        req: &TransferLeaderRequest,
    ) -> Result<(AdminResponse, ApplyResult)> {
        let resp = AdminResponse::TransferLeader;
        Ok((
            resp,
            ApplyResult::Res(ExecResult::TransferLeader { peer: req.peer }),
        ))
    }

    fn exec_write_cmd(
        &mut self,
        ctx: &mut ApplyContext<EK>,
        requests: &[Request],
    ) -> Result<(RaftCmdResponse, Option<RegionSnapshot<EK::Snapshot>>, ApplyResult)> {
        let mut responses = Vec::with_capacity(requests.len());
        let mut snapshot = None;
        for req in requests {
            let resp = match req {
                Request::Put { cf, key, value } => {
                    util::check_key_in_region(key, &self.region)?;
                    ctx.wb.put_cf(cf, &keys::data_key(key), value)?;
                    self.metrics.size_diff_hint += (key.len() + value.len()) as i64;
                    self.metrics.written_bytes += (key.len() + value.len()) as u64;
                    self.metrics.written_keys += 1;
                    Response::Put
                }
                Request::Delete { cf, key } => {
                    util::check_key_in_region(key, &self.region)?;
                    ctx.wb.delete_cf(cf, &keys::data_key(key))?;
                    self.metrics.size_diff_hint -= key.len() as i64;
                    self.metrics.delete_keys_hint += 1;
                    Response::Delete
                }
                Request::Get { cf, key } => {
                    util::check_key_in_region(key, &self.region)?;
                    // Reads must observe every write applied earlier in
                    // this batch.
                    ctx.commit();
                    let value = ctx
                        .engines
                        .kv
                        .get_value_cf(cf, &keys::data_key(key))?;
                    Response::Get { value }
                }
                Request::Snap => {
                    ctx.commit();
                    snapshot = Some(RegionSnapshot::new(
                        ctx.engines.kv.snapshot(),
                        self.region.clone(),
                    ));
                    Response::Snap {
                        region: self.region.clone(),
                    }
                }
            };
            responses.push(resp);
        }
        let resp = RaftCmdResponse {
            responses,
            ..Default::default()
        };
        Ok((resp, snapshot, ApplyResult::None))
    }

    fn clear_pending_commands(&mut self) {
        while let Some(cmd) = self.pending_cmds.normals.pop_front() {
            notify_region_removed(self.region.id, cmd);
        }
        if let Some(cmd) = self.pending_cmds.conf_change.take() {
            notify_region_removed(self.region.id, cmd);
        }
    }

    fn clear_all_commands_as_stale(&mut self) {
        let term = self.term;
        while let Some(cmd) = self.pending_cmds.normals.pop_front() {
            notify_stale_command(term, cmd);
        }
        if let Some(cmd) = self.pending_cmds.conf_change.take() {
            notify_stale_command(term, cmd);
        }
    }

    fn destroy(&mut self) {
        self.stopped = true;
        self.clear_pending_commands();
    }
}

/// One apply worker: owns the delegates of the regions hashed to it and
/// loops over its unbounded task queue.
pub(crate) fn apply_worker_loop<EK: KvEngine>(
    receiver: Receiver<ApplyTicket<EK>>,
    engines: Engines<EK>,
    router: Router<EK>,
    logger: Logger,
) {
    let mut delegates: HashMap<u64, ApplyDelegate<EK>> = HashMap::new();
    while let Ok(ticket) = receiver.recv() {
        let msg = match ticket {
            ApplyTicket::Msg(msg) => msg,
            ApplyTicket::Stop => {
                // Outstanding commands must still resolve, or their
                // single-shot guarantee would trip on teardown.
                for (_, mut delegate) in delegates.drain() {
                    delegate.destroy();
                }
                break;
            }
        };
        match msg {
            ApplyMsg::Registration(reg) => {
                let region_id = reg.region.id;
                let delegate = ApplyDelegate::from_registration(reg);
                if let Some(mut old) = delegates.insert(region_id, delegate) {
                    // A snapshot re-registered the peer; everything the old
                    // delegate still owed is stale now.
                    old.clear_all_commands_as_stale();
                }
            }
            ApplyMsg::Proposal(rp) => match delegates.get_mut(&rp.region_id) {
                Some(delegate) if !delegate.stopped => delegate.append_proposals(rp.props),
                _ => {
                    for p in rp.props {
                        notify_req_region_removed(rp.region_id, p.cb);
                    }
                }
            },
            ApplyMsg::Apply(apply) => {
                let delegate = match delegates.get_mut(&apply.region_id) {
                    Some(d) if !d.stopped => d,
                    _ => continue,
                };
                if apply.entries.is_empty() {
                    continue;
                }
                delegate.metrics = ApplyMetrics::default();
                delegate.term = apply.term;
                let mut ctx = ApplyContext::new(engines.clone(), logger.clone());
                let exec_res = delegate.handle_raft_committed_entries(&mut ctx, apply.entries);
                ctx.finish_for(delegate);
                let res = ApplyRes {
                    region_id: delegate.region.id,
                    apply_state: delegate.apply_state,
                    applied_index_term: delegate.applied_index_term,
                    exec_res,
                    metrics: delegate.metrics,
                };
                // Apply results can't be lost: the peer's applied cursor
                // and the client callbacks both hang off this message.
                let _ = router.force_send(apply.region_id, PeerMsg::ApplyRes(TaskRes::Apply(res)));
            }
            ApplyMsg::Destroy { region_id } => {
                if let Some(mut delegate) = delegates.remove(&region_id) {
                    let peer_id = delegate.id;
                    delegate.destroy();
                    info!(
                        logger,
                        "remove delegate from apply delegates";
                        "region_id" => region_id,
                        "peer_id" => peer_id,
                    );
                    let _ = router.force_send(
                        region_id,
                        PeerMsg::ApplyRes(TaskRes::Destroy { region_id, peer_id }),
                    );
                }
            }
        }
    }
}
