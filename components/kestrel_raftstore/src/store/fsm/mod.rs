// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Wiring of the per-store state machines: the shared context handed to
//! every handler, the worker threads that drain peer and store mailboxes,
//! and the lifecycle of the whole store system.

pub mod apply;
pub mod peer;
pub mod store;

pub use self::apply::ApplyRouter;
pub use self::peer::{PeerFsm, PeerMsgHandler};
pub use self::store::{StoreFsm, StoreMsgHandler};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder as ThreadBuilder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use kestrel_engine::{Engines, Iterable, KvEngine};
use kestrel_pd::PdClient;
use kestrel_proto::metapb;
use kestrel_proto::raft_serverpb::{PeerState, RegionLocalState};
use kestrel_util::worker::{Scheduler, Worker};
use slog::{info, warn, Logger};

use crate::keys::{self, enc_end_key};
use crate::store::config::Config;
use crate::store::fsm::apply::{apply_worker_loop, ApplyTicket};
use crate::store::fsm::store::StoreMeta;
use crate::store::msg::{PeerMsg, StoreMsg};
use crate::store::router::{Router, StoreTicket, Ticket};
use crate::store::snap::{SnapKey, SnapManager};
use crate::store::ticker::Ticker;
use crate::store::transport::Transport;
use crate::store::worker::{
    PdRunner, PdTask, RaftlogGcRunner, RaftlogGcTask, RegionRunner, RegionTask, SplitCheckRunner,
    SplitCheckTask,
};
use crate::{Error, Result};

/// Shared environment of every message handler on one store.
pub struct StoreContext<EK: KvEngine, T: Transport> {
    pub cfg: Arc<Config>,
    pub store: metapb::Store,
    pub engines: Engines<EK>,
    pub store_meta: Arc<Mutex<StoreMeta>>,
    pub snap_mgr: SnapManager,
    pub router: Router<EK>,
    pub apply_router: ApplyRouter<EK>,
    pub trans: T,
    pub pd_scheduler: Scheduler<PdTask<EK>>,
    pub region_scheduler: Scheduler<RegionTask>,
    pub raftlog_gc_scheduler: Scheduler<RaftlogGcTask>,
    pub split_check_scheduler: Scheduler<SplitCheckTask>,
    /// Peers re-register here after every tick they process.
    pub tick_driver: Sender<u64>,
    pub logger: Logger,
}

struct Workers<EK: KvEngine> {
    region_worker: Worker<RegionTask>,
    raftlog_gc_worker: Worker<RaftlogGcTask>,
    split_check_worker: Worker<SplitCheckTask>,
    pd_worker: Worker<PdTask<EK>>,
}

/// Handle of a running store: owns the worker threads and shuts them down
/// in dependency order.
pub struct StoreSystem<EK: KvEngine> {
    router: Router<EK>,
    apply_router: ApplyRouter<EK>,
    handles: Vec<JoinHandle<()>>,
    tick_stop: Arc<AtomicBool>,
    workers: Option<Workers<EK>>,
    logger: Logger,
}

impl<EK: KvEngine> StoreSystem<EK> {
    pub fn router(&self) -> Router<EK> {
        self.router.clone()
    }

    pub fn shutdown(&mut self) {
        let workers = match self.workers.take() {
            Some(w) => w,
            None => return,
        };
        info!(self.logger, "begin to shut down store system");
        self.tick_stop.store(true, Ordering::SeqCst);
        self.router.shutdown();
        self.apply_router.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        let Workers {
            mut region_worker,
            mut raftlog_gc_worker,
            mut split_check_worker,
            mut pd_worker,
        } = workers;
        region_worker.stop();
        raftlog_gc_worker.stop();
        split_check_worker.stop();
        pd_worker.stop();
        info!(self.logger, "store system stopped");
    }
}

impl<EK: KvEngine> Drop for StoreSystem<EK> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds and starts the full store system: routers, peer/apply/store
/// workers, background workers, and the tick driver. Existing peers are
/// recovered from the engine before any message is accepted.
pub fn create_raft_store<EK, T, C>(
    cfg: Arc<Config>,
    store: metapb::Store,
    engines: Engines<EK>,
    trans: T,
    pd_client: Arc<C>,
    snap_mgr: SnapManager,
    logger: Logger,
) -> Result<(Router<EK>, StoreSystem<EK>)>
where
    EK: KvEngine,
    T: Transport,
    C: PdClient,
{
    let mut peer_senders = Vec::with_capacity(cfg.peer_pool_size);
    let mut peer_receivers = Vec::with_capacity(cfg.peer_pool_size);
    for _ in 0..cfg.peer_pool_size {
        let (tx, rx) = channel::unbounded::<Ticket<EK>>();
        peer_senders.push(tx);
        peer_receivers.push(rx);
    }
    let (store_sender, store_receiver) = channel::unbounded::<StoreTicket>();
    let router = Router::new(peer_senders, store_sender, cfg.notify_capacity);

    let mut apply_senders = Vec::with_capacity(cfg.apply_pool_size);
    let mut apply_receivers = Vec::with_capacity(cfg.apply_pool_size);
    for _ in 0..cfg.apply_pool_size {
        let (tx, rx) = channel::unbounded::<ApplyTicket<EK>>();
        apply_senders.push(tx);
        apply_receivers.push(rx);
    }
    let apply_router = ApplyRouter::new(apply_senders);

    let region_worker = Worker::new(
        "region-worker",
        RegionRunner::new(engines.clone(), snap_mgr.clone(), logger.clone()),
    );
    let raftlog_gc_worker = Worker::new(
        "raftlog-gc-worker",
        RaftlogGcRunner::new(engines.clone(), logger.clone()),
    );
    let split_check_worker = Worker::new(
        "split-check-worker",
        SplitCheckRunner::new(
            engines.kv.clone(),
            router.clone(),
            Arc::clone(&cfg),
            logger.clone(),
        ),
    );
    let pd_worker = Worker::new(
        "pd-worker",
        PdRunner::new(store.id, pd_client, router.clone(), logger.clone()),
    );

    let (tick_sender, tick_receiver) = channel::unbounded::<u64>();

    let ctx = Arc::new(StoreContext {
        cfg: Arc::clone(&cfg),
        store: store.clone(),
        engines: engines.clone(),
        store_meta: Arc::new(Mutex::new(StoreMeta::new())),
        snap_mgr: snap_mgr.clone(),
        router: router.clone(),
        apply_router: apply_router.clone(),
        trans,
        pd_scheduler: pd_worker.scheduler(),
        region_scheduler: region_worker.scheduler(),
        raftlog_gc_scheduler: raftlog_gc_worker.scheduler(),
        split_check_scheduler: split_check_worker.scheduler(),
        tick_driver: tick_sender,
        logger: logger.clone(),
    });

    let region_peers = load_peers(&ctx)?;

    let mut handles = Vec::new();
    for (i, receiver) in peer_receivers.into_iter().enumerate() {
        let ctx = Arc::clone(&ctx);
        let handle = ThreadBuilder::new()
            .name(format!("raftstore-{}", i))
            .spawn(move || peer_worker_loop(receiver, ctx))
            .unwrap();
        handles.push(handle);
    }
    for (i, receiver) in apply_receivers.into_iter().enumerate() {
        let engines = engines.clone();
        let router = router.clone();
        let logger = logger.clone();
        let handle = ThreadBuilder::new()
            .name(format!("apply-{}", i))
            .spawn(move || apply_worker_loop(receiver, engines, router, logger))
            .unwrap();
        handles.push(handle);
    }
    {
        let ctx = Arc::clone(&ctx);
        let store_fsm = StoreFsm {
            store: store.clone(),
            ticker: Ticker::new_store(&cfg),
        };
        let handle = ThreadBuilder::new()
            .name("raftstore-store".to_owned())
            .spawn(move || store_worker_loop(store_receiver, store_fsm, ctx))
            .unwrap();
        handles.push(handle);
    }

    let tick_stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&tick_stop);
        let router = router.clone();
        let base = cfg.raft_base_tick_interval.0;
        let logger = logger.clone();
        let handle = ThreadBuilder::new()
            .name("tick-driver".to_owned())
            .spawn(move || tick_driver_loop(tick_receiver, router, base, stop, logger))
            .unwrap();
        handles.push(handle);
    }

    // Everything is in place; wake the store and the recovered peers.
    router.send_store(StoreMsg::Start { store })?;
    for region_id in region_peers {
        let _ = router.force_send(region_id, PeerMsg::Start);
    }

    let system = StoreSystem {
        router: router.clone(),
        apply_router,
        handles,
        tick_stop,
        workers: Some(Workers {
            region_worker,
            raftlog_gc_worker,
            split_check_worker,
            pd_worker,
        }),
        logger,
    };
    Ok((router, system))
}

/// Recovers every non-tombstone peer recorded in the kv engine and indexes
/// it in the store metadata. A snapshot apply interrupted by a crash is
/// finished here before the store accepts messages.
fn load_peers<EK: KvEngine, T: Transport>(ctx: &StoreContext<EK, T>) -> Result<Vec<u64>> {
    let mut states = Vec::new();
    ctx.engines.kv.scan(
        keys::REGION_META_MIN_KEY,
        keys::REGION_META_MAX_KEY,
        |key, value| {
            let region_id = match keys::decode_region_meta_key(key) {
                Some(id) => id,
                None => return Ok(true),
            };
            let state: RegionLocalState = bincode::deserialize(value)
                .map_err(|e| kestrel_engine::Error::Other(e.to_string()))?;
            states.push((region_id, state));
            Ok(true)
        },
    )?;

    let mut meta = ctx.store_meta.lock().unwrap();
    let mut region_ids = Vec::new();
    let mut tombstone_count = 0;
    for (region_id, state) in states {
        if state.state == PeerState::Tombstone {
            tombstone_count += 1;
            continue;
        }
        if state.state == PeerState::Applying {
            // A snapshot ingest was cut short; replay it from the received
            // file before the peer comes back.
            recover_applying_snapshot(ctx, region_id, &state)?;
        }
        let region = state.region;
        let fsm = PeerFsm::create(
            ctx.store.id,
            &ctx.cfg,
            ctx.region_scheduler.clone(),
            ctx.engines.clone(),
            &region,
            &ctx.logger,
        )?;
        if let Some(other) = meta.region_ranges.insert(enc_end_key(&region), region_id) {
            panic!(
                "[region {}] overlaps with region {} at startup",
                region_id, other
            );
        }
        meta.regions.insert(region_id, region);
        ctx.router.register(region_id, fsm);
        region_ids.push(region_id);
    }
    info!(
        ctx.logger,
        "start store";
        "store_id" => ctx.store.id,
        "region_count" => region_ids.len(),
        "tombstone_count" => tombstone_count,
    );
    Ok(region_ids)
}

fn recover_applying_snapshot<EK: KvEngine, T: Transport>(
    ctx: &StoreContext<EK, T>,
    region_id: u64,
    state: &RegionLocalState,
) -> Result<()> {
    let apply_state = ctx
        .engines
        .kv
        .get_msg::<kestrel_proto::raft_serverpb::RaftApplyState>(&keys::apply_state_key(region_id))?
        .ok_or_else(|| {
            Error::Other(kestrel_util::box_err!(
                "[region {}] applying state without apply state",
                region_id
            ))
        })?;
    let snap_key = SnapKey::new(
        region_id,
        apply_state.truncated_state.term,
        apply_state.truncated_state.index,
    );
    warn!(
        ctx.logger,
        "region is applying snapshot, recovering";
        "region_id" => region_id,
        "snap_key" => %snap_key,
        "region" => ?state.region,
    );
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    ctx.region_scheduler
        .schedule(RegionTask::Apply {
            region_id,
            snap_key,
            notifier: tx,
        })
        .map_err(|_| Error::Other("region worker stopped".into()))?;
    match rx.recv() {
        Ok(true) => Ok(()),
        res => panic!(
            "[region {}] failed to recover applying snapshot: {:?}",
            region_id, res
        ),
    }
}

/// One peer worker: drains its share of the peer mailboxes, hands each
/// batch to the message handler, and drives raft ready for every peer it
/// touched.
fn peer_worker_loop<EK: KvEngine, T: Transport>(
    receiver: Receiver<Ticket<EK>>,
    ctx: Arc<StoreContext<EK, T>>,
) {
    loop {
        let mut batch: Vec<(u64, PeerMsg<EK>)> = Vec::new();
        match receiver.recv() {
            Ok(Ticket::Peer(region_id, msg)) => batch.push((region_id, msg)),
            Ok(Ticket::Stop) | Err(_) => return,
        }
        let mut stopping = false;
        while batch.len() < ctx.cfg.messages_per_tick {
            match receiver.try_recv() {
                Ok(Ticket::Peer(region_id, msg)) => batch.push((region_id, msg)),
                Ok(Ticket::Stop) => {
                    stopping = true;
                    break;
                }
                Err(_) => break,
            }
        }

        // Group per region, preserving first-arrival order across groups.
        let mut order: Vec<u64> = Vec::new();
        let mut grouped: HashMap<u64, Vec<PeerMsg<EK>>> = HashMap::new();
        for (region_id, msg) in batch {
            grouped
                .entry(region_id)
                .or_insert_with(|| {
                    order.push(region_id);
                    Vec::new()
                })
                .push(msg);
        }

        for region_id in order {
            let msgs = grouped.remove(&region_id).unwrap();
            let state = match ctx.router.get(region_id) {
                Some(state) if !state.is_closed() => state,
                _ => {
                    // The peer is gone; commands must still be answered.
                    for msg in msgs {
                        if let PeerMsg::RaftCommand(cmd) = msg {
                            apply::notify_req_region_removed(region_id, cmd.callback);
                        }
                    }
                    continue;
                }
            };
            let mut fsm = state.peer.lock().unwrap();
            let mut handler = PeerMsgHandler::new(&mut fsm, ctx.as_ref());
            for msg in msgs {
                handler.handle_msg(msg);
            }
            handler.handle_raft_ready();
        }

        if stopping {
            return;
        }
    }
}

fn store_worker_loop<EK: KvEngine, T: Transport>(
    receiver: Receiver<StoreTicket>,
    mut fsm: StoreFsm,
    ctx: Arc<StoreContext<EK, T>>,
) {
    while let Ok(ticket) = receiver.recv() {
        match ticket {
            StoreTicket::Msg(msg) => {
                let mut handler = StoreMsgHandler::new(&mut fsm, ctx.as_ref());
                handler.handle_msg(msg);
            }
            StoreTicket::Stop => return,
        }
    }
}

/// Fires one `Tick` per base interval at every registered region plus the
/// store itself. Regions re-register after processing their tick, so a
/// destroyed peer silently falls out of the set.
fn tick_driver_loop<EK: KvEngine>(
    receiver: Receiver<u64>,
    router: Router<EK>,
    base_interval: Duration,
    stop: Arc<AtomicBool>,
    logger: Logger,
) {
    let ticker = channel::tick(base_interval);
    let mut regions: HashSet<u64> = HashSet::new();
    loop {
        crossbeam::select! {
            recv(receiver) -> msg => match msg {
                Ok(region_id) => {
                    regions.insert(region_id);
                }
                Err(_) => return,
            },
            recv(ticker) -> _ => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let ids: Vec<u64> = regions.drain().collect();
                for region_id in ids {
                    match router.send(region_id, PeerMsg::Tick) {
                        Ok(()) => {}
                        Err(channel::TrySendError::Full(_)) => {
                            // The worker is saturated; keep the region
                            // registered and try again next interval.
                            warn!(
                                logger,
                                "failed to deliver tick, mailbox full";
                                "region_id" => region_id,
                            );
                            regions.insert(region_id);
                        }
                        Err(channel::TrySendError::Disconnected(_)) => {
                            // The peer is gone; it re-registers itself if
                            // it ever comes back.
                        }
                    }
                }
                let _ = router.send_store(StoreMsg::Tick);
            }
        }
    }
}
