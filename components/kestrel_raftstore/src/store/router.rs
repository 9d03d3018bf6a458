// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Per-store message dispatcher.
//!
//! The router maps a region id to its peer's mailbox and owns the
//! store-level mailbox for messages no peer can take (typically raft
//! messages for peers that do not exist yet). Peer mailboxes are bounded:
//! a full mailbox pushes back on the transport. Ownership of peers is
//! static per worker (`region_id % pool_size`), so a peer is only ever
//! touched by one worker thread; the mutex around each peer is
//! uncontended and exists to move registration across threads safely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Sender, TrySendError};
use kestrel_engine::KvEngine;
use kestrel_proto::raft_serverpb::RaftMessage;

use crate::store::fsm::PeerFsm;
use crate::store::msg::{PeerMsg, StoreMsg};
use crate::{DiscardReason, Error, Result};

pub(crate) enum Ticket<EK: KvEngine> {
    Peer(u64, PeerMsg<EK>),
    Stop,
}

pub(crate) enum StoreTicket {
    Msg(StoreMsg),
    Stop,
}

/// Mailbox state of one registered peer.
pub struct PeerState<EK: KvEngine> {
    closed: AtomicBool,
    pub peer: Mutex<PeerFsm<EK>>,
}

impl<EK: KvEngine> PeerState<EK> {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Router<EK: KvEngine> {
    peers: Arc<Mutex<HashMap<u64, Arc<PeerState<EK>>>>>,
    peer_senders: Arc<Vec<Sender<Ticket<EK>>>>,
    store_sender: Sender<StoreTicket>,
    /// Soft bound on a worker queue; regular sends above it report `Full`
    /// to push back on the transport, `force_send` ignores it.
    capacity: usize,
}

impl<EK: KvEngine> Clone for Router<EK> {
    fn clone(&self) -> Router<EK> {
        Router {
            peers: Arc::clone(&self.peers),
            peer_senders: Arc::clone(&self.peer_senders),
            store_sender: self.store_sender.clone(),
            capacity: self.capacity,
        }
    }
}

impl<EK: KvEngine> Router<EK> {
    pub(crate) fn new(
        peer_senders: Vec<Sender<Ticket<EK>>>,
        store_sender: Sender<StoreTicket>,
        capacity: usize,
    ) -> Router<EK> {
        Router {
            peers: Arc::new(Mutex::new(HashMap::new())),
            peer_senders: Arc::new(peer_senders),
            store_sender,
            capacity,
        }
    }

    /// Registers a new peer. Registering a live duplicate means the store
    /// metadata diverged and is unrecoverable.
    pub fn register(&self, region_id: u64, fsm: PeerFsm<EK>) {
        let mut peers = self.peers.lock().unwrap();
        let state = Arc::new(PeerState {
            closed: AtomicBool::new(false),
            peer: Mutex::new(fsm),
        });
        if let Some(old) = peers.insert(region_id, state) {
            if !old.is_closed() {
                panic!("[region {}] duplicated peer registration", region_id);
            }
        }
    }

    pub fn get(&self, region_id: u64) -> Option<Arc<PeerState<EK>>> {
        self.peers.lock().unwrap().get(&region_id).cloned()
    }

    /// Closing is idempotent; pending messages for the peer are dropped by
    /// the worker once it observes the closed flag.
    pub fn close(&self, region_id: u64) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(state) = peers.remove(&region_id) {
            state.closed.store(true, Ordering::SeqCst);
        }
    }

    fn do_send(
        &self,
        region_id: u64,
        msg: PeerMsg<EK>,
        force: bool,
    ) -> std::result::Result<(), TrySendError<PeerMsg<EK>>> {
        let state = self.peers.lock().unwrap().get(&region_id).cloned();
        match state {
            Some(state) if !state.is_closed() => {}
            _ => return Err(TrySendError::Disconnected(msg)),
        }
        let idx = (region_id % self.peer_senders.len() as u64) as usize;
        let sender = &self.peer_senders[idx];
        if !force && sender.len() >= self.capacity {
            return Err(TrySendError::Full(msg));
        }
        sender
            .send(Ticket::Peer(region_id, msg))
            .map_err(|e| match e.into_inner() {
                Ticket::Peer(_, m) => TrySendError::Disconnected(m),
                Ticket::Stop => unreachable!(),
            })
    }

    pub fn send(
        &self,
        region_id: u64,
        msg: PeerMsg<EK>,
    ) -> std::result::Result<(), TrySendError<PeerMsg<EK>>> {
        self.do_send(region_id, msg, false)
    }

    /// For messages that must not be lost (startup, apply results): the
    /// queue bound does not apply to them.
    pub fn force_send(
        &self,
        region_id: u64,
        msg: PeerMsg<EK>,
    ) -> std::result::Result<(), TrySendError<PeerMsg<EK>>> {
        self.do_send(region_id, msg, true)
    }

    pub fn send_store(&self, msg: StoreMsg) -> Result<()> {
        self.store_sender
            .send(StoreTicket::Msg(msg))
            .map_err(|_| Error::Transport(DiscardReason::Disconnected))
    }

    /// Routes a raft message to its peer, or to the store mailbox so a
    /// missing peer can be created. A full mailbox drops the message; raft
    /// will retransmit.
    pub fn send_raft_message(&self, msg: RaftMessage) -> Result<()> {
        let region_id = msg.region_id;
        match self.send(region_id, PeerMsg::RaftMessage(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Transport(DiscardReason::Full)),
            Err(TrySendError::Disconnected(PeerMsg::RaftMessage(msg))) => {
                self.send_store(StoreMsg::RaftMessage(msg))
            }
            Err(TrySendError::Disconnected(_)) => unreachable!(),
        }
    }

    /// Region ids of all live peers, in worker-ownership order.
    pub fn registered_regions(&self) -> Vec<u64> {
        let peers = self.peers.lock().unwrap();
        peers
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn shutdown(&self) {
        for sender in self.peer_senders.iter() {
            let _ = sender.send(Ticket::Stop);
        }
        let _ = self.store_sender.send(StoreTicket::Stop);
    }
}
