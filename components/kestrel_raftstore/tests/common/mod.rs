// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! In-process cluster harness: several stores wired through a channel
//! transport and a shared placement stub. The transport ferries snapshot
//! files between the per-store snapshot managers the way the streaming
//! RPC would in a real deployment.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kestrel_engine::{Engines, MemEngine};
use kestrel_pd::{MockPdClient, PdClient};
use kestrel_proto::metapb;
use kestrel_proto::raft_cmdpb::{
    AdminRequest, ChangePeerRequest, ConfChangeKind, RaftCmdRequest, RaftCmdResponse,
    RaftRequestHeader, Request, Response, TransferLeaderRequest,
};
use kestrel_proto::raft_serverpb::RaftMessage;
use kestrel_raftstore::store::{
    Callback, Config, Node, PeerMsg, RaftCommand, Router, SnapKey, SnapManager, Transport,
};
use kestrel_raftstore::Result;
use kestrel_util::config::{ReadableDuration, ReadableSize};
use slog::{o, Drain, Logger};

pub const CF_DEFAULT: &str = "default";

pub fn test_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).chan_size(8192).build().fuse();
    let drain = drain.filter_level(slog::Level::Warning).fuse();
    Logger::root(drain, o!())
}

/// Fast timers so scenarios finish in well under a second of logical
/// time.
pub fn test_config() -> Config {
    Config {
        raft_base_tick_interval: ReadableDuration::millis(20),
        raft_heartbeat_ticks: 2,
        raft_election_timeout_ticks: 10,
        raft_log_gc_tick_interval: ReadableDuration::millis(100),
        raft_log_gc_count_limit: 100_000,
        split_region_check_tick_interval: ReadableDuration::millis(100),
        region_max_size: ReadableSize::mb(144),
        region_split_size: ReadableSize::mb(96),
        pd_heartbeat_tick_interval: ReadableDuration::millis(100),
        pd_store_heartbeat_tick_interval: ReadableDuration::millis(100),
        snap_mgr_gc_tick_interval: ReadableDuration::millis(100),
        snap_gc_timeout: ReadableDuration::hours(4),
        ..Default::default()
    }
}

struct StoreRoute {
    router: Router<MemEngine>,
    snap_mgr: SnapManager,
}

#[derive(Default)]
struct TransportCore {
    routes: HashMap<u64, StoreRoute>,
    /// Stores cut off from the rest of the cluster.
    isolated: HashSet<u64>,
}

/// Channel transport between in-process stores.
#[derive(Clone)]
pub struct ChannelTransport {
    core: Arc<Mutex<TransportCore>>,
}

impl ChannelTransport {
    pub fn new() -> ChannelTransport {
        ChannelTransport {
            core: Arc::new(Mutex::new(TransportCore::default())),
        }
    }

    fn register(&self, store_id: u64, router: Router<MemEngine>, snap_mgr: SnapManager) {
        let mut core = self.core.lock().unwrap();
        core.routes.insert(store_id, StoreRoute { router, snap_mgr });
    }

    pub fn isolate(&self, store_id: u64) {
        self.core.lock().unwrap().isolated.insert(store_id);
    }

    pub fn heal(&self, store_id: u64) {
        self.core.lock().unwrap().isolated.remove(&store_id);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, msg: RaftMessage) -> Result<()> {
        let core = self.core.lock().unwrap();
        let from_store = msg.from_peer.store_id;
        let to_store = msg.to_peer.store_id;
        if core.isolated.contains(&from_store) || core.isolated.contains(&to_store) {
            return Ok(());
        }
        let to = match core.routes.get(&to_store) {
            Some(to) => to,
            None => return Ok(()),
        };
        // Snapshot payloads travel as files; copy between the snapshot
        // managers the way the chunked stream would.
        if msg.message.has_snapshot() && msg.message.get_snapshot().get_metadata().get_index() > 0 {
            let key = SnapKey::from_region_snap(msg.region_id, msg.message.get_snapshot());
            if let Some(from) = core.routes.get(&from_store) {
                if let Ok(file) = from.snap_mgr.get_snapshot_for_sending(key) {
                    if let Ok(data) = file.load() {
                        let _ = to.snap_mgr.save_received_snapshot(key, &data);
                    }
                }
            }
        }
        let _ = to.router.send_raft_message(msg);
        Ok(())
    }
}

pub struct StoreHandle {
    pub store_id: u64,
    pub node: Node<MemEngine, MockPdClient>,
    pub router: Router<MemEngine>,
    pub engines: Engines<MemEngine>,
    pub snap_mgr: SnapManager,
    _snap_dir: tempfile::TempDir,
}

pub struct Cluster {
    pub cfg: Config,
    pub pd: Arc<MockPdClient>,
    pub trans: ChannelTransport,
    pub stores: Vec<StoreHandle>,
    pub logger: Logger,
}

impl Cluster {
    /// Boots `count` stores. The first one bootstraps the cluster and
    /// carries the initial region covering the whole key space.
    pub fn start(count: usize) -> Cluster {
        Cluster::start_with_config(count, test_config())
    }

    pub fn start_with_config(count: usize, cfg: Config) -> Cluster {
        let logger = test_logger();
        let pd = Arc::new(MockPdClient::new(1));
        let trans = ChannelTransport::new();
        let mut cluster = Cluster {
            cfg,
            pd,
            trans,
            stores: Vec::new(),
            logger,
        };
        for _ in 0..count {
            cluster.add_store();
        }
        cluster
    }

    pub fn add_store(&mut self) -> u64 {
        let mut cfg = self.cfg.clone();
        cfg.store_addr = format!("127.0.0.1:{}", 20160 + self.stores.len());
        let engines = Engines::new(MemEngine::new(), MemEngine::new());
        let snap_dir = tempfile::TempDir::new().unwrap();
        let snap_mgr = SnapManager::new(snap_dir.path());
        snap_mgr.init().unwrap();
        let mut node = Node::new(cfg, Arc::clone(&self.pd), self.logger.clone()).unwrap();
        let router = node
            .start(engines.clone(), self.trans.clone(), snap_mgr.clone())
            .unwrap();
        let store_id = node.id();
        self.trans.register(store_id, router.clone(), snap_mgr.clone());
        self.stores.push(StoreHandle {
            store_id,
            node,
            router,
            engines,
            snap_mgr,
            _snap_dir: snap_dir,
        });
        store_id
    }

    pub fn store(&self, store_id: u64) -> &StoreHandle {
        self.stores
            .iter()
            .find(|s| s.store_id == store_id)
            .expect("unknown store")
    }

    /// The id of the region bootstrapped over the whole key space.
    pub fn first_region_id(&self) -> u64 {
        self.pd.get_region(b"").unwrap().id
    }

    /// Peer and region view of a region on one store, if that store hosts
    /// a live peer of it.
    pub fn peer_view(&self, store_id: u64, region_id: u64) -> Option<(metapb::Peer, metapb::Region, bool)> {
        let handle = self.store(store_id);
        let state = handle.router.get(region_id)?;
        if state.is_closed() {
            return None;
        }
        let fsm = state.peer.lock().unwrap();
        Some((
            fsm.peer.peer,
            fsm.peer.region().clone(),
            fsm.peer.is_leader(),
        ))
    }

    /// The store currently leading a region, waiting for an election to
    /// settle if necessary.
    pub fn wait_leader(&self, region_id: u64) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut leaders = Vec::new();
            for handle in &self.stores {
                if let Some((_, _, is_leader)) = self.peer_view(handle.store_id, region_id) {
                    if is_leader {
                        leaders.push(handle.store_id);
                    }
                }
            }
            if leaders.len() == 1 {
                return leaders[0];
            }
            if Instant::now() > deadline {
                panic!("no unique leader for region {}: {:?}", region_id, leaders);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn call_command(
        &self,
        store_id: u64,
        request: RaftCmdRequest,
        read: bool,
    ) -> Option<RaftCmdResponse> {
        let (tx, rx) = mpsc::channel();
        let cb = if read {
            Callback::Read(Box::new(move |resp| {
                let _ = tx.send(resp.response);
            }))
        } else {
            Callback::Write(Box::new(move |resp| {
                let _ = tx.send(resp.response);
            }))
        };
        let handle = self.store(store_id);
        let region_id = request.header.region_id;
        if handle
            .router
            .send(region_id, PeerMsg::RaftCommand(RaftCommand::new(request, cb)))
            .is_err()
        {
            return None;
        }
        rx.recv_timeout(Duration::from_secs(5)).ok()
    }

    fn new_request(&self, store_id: u64, region_id: u64, requests: Vec<Request>) -> Option<RaftCmdRequest> {
        let (peer, region, _) = self.peer_view(store_id, region_id)?;
        Some(RaftCmdRequest {
            header: RaftRequestHeader {
                region_id,
                peer,
                region_epoch: region.region_epoch,
                term: 0,
            },
            requests,
            admin_request: None,
        })
    }

    /// Runs one request for `key`, re-resolving the owning region and its
    /// leader on every attempt so it survives splits, conf changes, and
    /// elections.
    pub fn must_request_on_key(&self, key: &[u8], requests: Vec<Request>, read: bool) -> RaftCmdResponse {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let region_id = self.region_id_for(key);
            let leader_store = self.wait_leader(region_id);
            if let Some(req) = self.new_request(leader_store, region_id, requests.clone()) {
                if let Some(resp) = self.call_command(leader_store, req, read) {
                    if resp.header.error.is_none() {
                        return resp;
                    }
                }
            }
            if Instant::now() > deadline {
                panic!("request for key {:?} kept failing", key);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn must_put(&self, key: &[u8], value: &[u8]) {
        let resp = self.must_request_on_key(
            key,
            vec![Request::Put {
                cf: CF_DEFAULT.to_owned(),
                key: key.to_vec(),
                value: value.to_vec(),
            }],
            false,
        );
        assert!(resp.header.error.is_none(), "{:?}", resp);
    }

    pub fn must_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let resp = self.must_request_on_key(
            key,
            vec![Request::Get {
                cf: CF_DEFAULT.to_owned(),
                key: key.to_vec(),
            }],
            true,
        );
        match resp.responses.first() {
            Some(Response::Get { value }) => value.clone(),
            other => panic!("unexpected response {:?}", other),
        }
    }

    pub fn must_delete(&self, key: &[u8]) {
        let resp = self.must_request_on_key(
            key,
            vec![Request::Delete {
                cf: CF_DEFAULT.to_owned(),
                key: key.to_vec(),
            }],
            false,
        );
        assert!(resp.header.error.is_none(), "{:?}", resp);
    }

    /// Region owning `key` according to the placement driver's view.
    pub fn region_id_for(&self, key: &[u8]) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(region) = self.pd.get_region(key) {
                return region.id;
            }
            if Instant::now() > deadline {
                panic!("no region for key {:?}", key);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Proposes a membership change and waits until the driver observes
    /// it.
    pub fn must_change_peer(&self, region_id: u64, change_type: ConfChangeKind, peer: metapb::Peer) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader_store = self.wait_leader(region_id);
            if let Some((leader_peer, region, _)) = self.peer_view(leader_store, region_id) {
                let req = RaftCmdRequest {
                    header: RaftRequestHeader {
                        region_id,
                        peer: leader_peer,
                        region_epoch: region.region_epoch,
                        term: 0,
                    },
                    requests: vec![],
                    admin_request: Some(AdminRequest::ChangePeer(ChangePeerRequest {
                        change_type,
                        peer,
                    })),
                };
                if let Some(resp) = self.call_command(leader_store, req, false) {
                    if resp.header.error.is_none() {
                        // Wait until the change is visible in the
                        // driver's region view.
                        if self.wait_pd_peer(region_id, peer, change_type) {
                            return;
                        }
                    }
                }
            }
            if Instant::now() > deadline {
                panic!(
                    "conf change {:?} {:?} on region {} kept failing",
                    change_type, peer, region_id
                );
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn wait_pd_peer(&self, region_id: u64, peer: metapb::Peer, change_type: ConfChangeKind) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(Some(region)) = self.pd.get_region_by_id(region_id) {
                let present = region.peers.iter().any(|p| p.id == peer.id);
                match change_type {
                    ConfChangeKind::AddNode if present => return true,
                    ConfChangeKind::RemoveNode if !present => return true,
                    _ => {}
                }
            }
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn must_transfer_leader(&self, region_id: u64, peer: metapb::Peer) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader_store = self.wait_leader(region_id);
            if leader_store == peer.store_id {
                return;
            }
            if let Some((leader_peer, region, _)) = self.peer_view(leader_store, region_id) {
                let req = RaftCmdRequest {
                    header: RaftRequestHeader {
                        region_id,
                        peer: leader_peer,
                        region_epoch: region.region_epoch,
                        term: 0,
                    },
                    requests: vec![],
                    admin_request: Some(AdminRequest::TransferLeader(TransferLeaderRequest {
                        peer,
                    })),
                };
                let _ = self.call_command(leader_store, req, false);
            }
            if Instant::now() > deadline {
                panic!("leader transfer to {:?} kept failing", peer);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Allocates a peer id for a new replica on `store_id`.
    pub fn alloc_peer(&self, store_id: u64) -> metapb::Peer {
        metapb::Peer {
            id: self.pd.alloc_id().unwrap(),
            store_id,
        }
    }

    pub fn shutdown(&mut self) {
        for store in &mut self.stores {
            store.node.stop();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Waits until `f` holds, or panics with `what` after ten seconds.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
