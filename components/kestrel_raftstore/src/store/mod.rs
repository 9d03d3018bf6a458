// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

pub mod bootstrap;
pub mod cmd_resp;
pub mod config;
pub mod fsm;
pub mod util;
pub mod worker;

mod msg;
mod node;
mod peer;
mod peer_storage;
mod region_snapshot;
mod router;
mod snap;
mod ticker;
mod transport;

pub use self::config::Config;
pub use self::fsm::{create_raft_store, StoreContext, StoreSystem};
pub use self::fsm::store::StoreMeta;
pub use self::msg::{
    Callback, PeerMsg, PeerTick, RaftCommand, ReadResponse, StoreMsg, StoreTick, WriteResponse,
};
pub use self::node::Node;
pub use self::peer::Peer;
pub use self::peer_storage::{
    ApplySnapResult, PeerStorage, SnapState, RAFT_INIT_LOG_INDEX, RAFT_INIT_LOG_TERM,
};
pub use self::region_snapshot::RegionSnapshot;
pub use self::router::{PeerState as RouterPeerState, Router};
pub use self::snap::{SnapEntry, SnapError, SnapKey, SnapManager};
pub use self::ticker::Ticker;
pub use self::transport::Transport;
