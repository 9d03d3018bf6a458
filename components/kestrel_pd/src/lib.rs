// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Placement driver client surface.
//!
//! The placement driver owns cluster-wide identity (store ids, region ids,
//! peer ids), decides placement, and learns the cluster shape through
//! heartbeats. Stores talk to it through [`PdClient`]; the in-process
//! [`MockPdClient`] serves tests and single-node deployments, a networked
//! implementation lives behind the RPC boundary.

mod mock;

use std::result;

use kestrel_proto::metapb;
use thiserror::Error;

pub use crate::mock::MockPdClient;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster {0} is already bootstrapped")]
    ClusterBootstrapped(u64),
    #[error("cluster {0} is not bootstrapped")]
    ClusterNotBootstrapped(u64),
    #[error("store {0} not found")]
    StoreNotFound(u64),
    #[error("region for key {0:?} not found")]
    RegionNotFound(Vec<u8>),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = result::Result<T, Error>;

/// Statistics a leader reports with a region heartbeat.
#[derive(Clone, Debug, Default)]
pub struct RegionStat {
    pub approximate_size: u64,
    /// Peers that have been added but have not caught up yet.
    pub pending_peers: Vec<metapb::Peer>,
}

#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub store_id: u64,
    pub region_count: u64,
}

/// Identity assignment for one region produced by a split.
#[derive(Clone, Debug, Default)]
pub struct SplitId {
    pub new_region_id: u64,
    pub new_peer_ids: Vec<u64>,
}

pub trait PdClient: Send + Sync + 'static {
    fn get_cluster_id(&self) -> Result<u64>;

    /// Allocates a globally unique, monotonically increasing id. Used for
    /// store ids, region ids, and peer ids alike.
    fn alloc_id(&self) -> Result<u64>;

    fn is_cluster_bootstrapped(&self) -> Result<bool>;

    /// Installs the first region of a fresh cluster. Fails when another
    /// store won the bootstrap race.
    fn bootstrap_cluster(&self, store: metapb::Store, region: metapb::Region) -> Result<()>;

    fn put_store(&self, store: metapb::Store) -> Result<()>;

    fn get_store(&self, store_id: u64) -> Result<metapb::Store>;

    fn get_region(&self, key: &[u8]) -> Result<metapb::Region>;

    fn get_region_by_id(&self, region_id: u64) -> Result<Option<metapb::Region>>;

    /// Reports the current shape of a region from its leader.
    fn region_heartbeat(
        &self,
        region: metapb::Region,
        leader: metapb::Peer,
        stat: RegionStat,
    ) -> Result<()>;

    /// Asks for identities for `count` regions about to be split off.
    fn ask_batch_split(&self, region: metapb::Region, count: usize) -> Result<Vec<SplitId>>;

    fn report_batch_split(&self, regions: Vec<metapb::Region>) -> Result<()>;

    fn store_heartbeat(&self, stats: StoreStats) -> Result<()>;
}
