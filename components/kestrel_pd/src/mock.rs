// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kestrel_proto::metapb;

use crate::{Error, PdClient, RegionStat, Result, SplitId, StoreStats};

#[derive(Default)]
struct Cluster {
    bootstrapped: bool,
    stores: HashMap<u64, metapb::Store>,
    regions: HashMap<u64, metapb::Region>,
    leaders: HashMap<u64, metapb::Peer>,
}

fn is_epoch_stale(epoch: metapb::RegionEpoch, check_epoch: metapb::RegionEpoch) -> bool {
    epoch.version < check_epoch.version || epoch.conf_ver < check_epoch.conf_ver
}

/// An in-process placement driver holding the cluster routing table in
/// memory. It performs no scheduling of its own; tests drive topology
/// changes explicitly.
pub struct MockPdClient {
    cluster_id: u64,
    id_alloc: AtomicU64,
    cluster: Mutex<Cluster>,
}

impl MockPdClient {
    pub fn new(cluster_id: u64) -> MockPdClient {
        MockPdClient {
            cluster_id,
            // Low ids are reserved for the bootstrap store and region.
            id_alloc: AtomicU64::new(1000),
            cluster: Mutex::new(Cluster::default()),
        }
    }

    /// Leader of a region as last reported by heartbeat.
    pub fn leader_of_region(&self, region_id: u64) -> Option<metapb::Peer> {
        self.cluster.lock().unwrap().leaders.get(&region_id).copied()
    }

    pub fn region_count(&self) -> usize {
        self.cluster.lock().unwrap().regions.len()
    }
}

impl PdClient for MockPdClient {
    fn get_cluster_id(&self) -> Result<u64> {
        Ok(self.cluster_id)
    }

    fn alloc_id(&self) -> Result<u64> {
        Ok(self.id_alloc.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn is_cluster_bootstrapped(&self) -> Result<bool> {
        Ok(self.cluster.lock().unwrap().bootstrapped)
    }

    fn bootstrap_cluster(&self, store: metapb::Store, region: metapb::Region) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        if cluster.bootstrapped {
            return Err(Error::ClusterBootstrapped(self.cluster_id));
        }
        cluster.stores.insert(store.id, store);
        cluster.regions.insert(region.id, region);
        cluster.bootstrapped = true;
        Ok(())
    }

    fn put_store(&self, store: metapb::Store) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        if !cluster.bootstrapped {
            return Err(Error::ClusterNotBootstrapped(self.cluster_id));
        }
        cluster.stores.insert(store.id, store);
        Ok(())
    }

    fn get_store(&self, store_id: u64) -> Result<metapb::Store> {
        let cluster = self.cluster.lock().unwrap();
        cluster
            .stores
            .get(&store_id)
            .cloned()
            .ok_or(Error::StoreNotFound(store_id))
    }

    fn get_region(&self, key: &[u8]) -> Result<metapb::Region> {
        let cluster = self.cluster.lock().unwrap();
        cluster
            .regions
            .values()
            .find(|r| {
                r.start_key.as_slice() <= key && (r.end_key.is_empty() || key < r.end_key.as_slice())
            })
            .cloned()
            .ok_or_else(|| Error::RegionNotFound(key.to_vec()))
    }

    fn get_region_by_id(&self, region_id: u64) -> Result<Option<metapb::Region>> {
        let cluster = self.cluster.lock().unwrap();
        Ok(cluster.regions.get(&region_id).cloned())
    }

    fn region_heartbeat(
        &self,
        region: metapb::Region,
        leader: metapb::Peer,
        _stat: RegionStat,
    ) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(cur) = cluster.regions.get(&region.id) {
            // A stale leader may report an old epoch after a conf change or
            // split it has not applied yet; keep the newer view.
            if is_epoch_stale(region.region_epoch, cur.region_epoch) {
                return Ok(());
            }
        }
        cluster.regions.insert(region.id, region.clone());
        cluster.leaders.insert(region.id, leader);
        Ok(())
    }

    fn ask_batch_split(&self, region: metapb::Region, count: usize) -> Result<Vec<SplitId>> {
        {
            let cluster = self.cluster.lock().unwrap();
            if !cluster.bootstrapped {
                return Err(Error::ClusterNotBootstrapped(self.cluster_id));
            }
        }
        let peer_count = region.peers.len();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let new_region_id = self.alloc_id()?;
            let mut new_peer_ids = Vec::with_capacity(peer_count);
            for _ in 0..peer_count {
                new_peer_ids.push(self.alloc_id()?);
            }
            ids.push(SplitId {
                new_region_id,
                new_peer_ids,
            });
        }
        Ok(ids)
    }

    fn report_batch_split(&self, _regions: Vec<metapb::Region>) -> Result<()> {
        Ok(())
    }

    fn store_heartbeat(&self, _stats: StoreStats) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_region(id: u64, start: &[u8], end: &[u8]) -> metapb::Region {
        metapb::Region {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            region_epoch: metapb::RegionEpoch {
                conf_ver: 1,
                version: 1,
            },
            peers: vec![metapb::Peer { id: 2, store_id: 1 }],
        }
    }

    #[test]
    fn test_bootstrap_once() {
        let pd = MockPdClient::new(1);
        assert!(!pd.is_cluster_bootstrapped().unwrap());
        let store = metapb::Store {
            id: 1,
            ..Default::default()
        };
        pd.bootstrap_cluster(store.clone(), new_region(2, b"", b""))
            .unwrap();
        assert!(pd.is_cluster_bootstrapped().unwrap());
        assert!(pd
            .bootstrap_cluster(store, new_region(2, b"", b""))
            .is_err());
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let pd = MockPdClient::new(1);
        pd.bootstrap_cluster(
            metapb::Store {
                id: 1,
                ..Default::default()
            },
            new_region(2, b"", b""),
        )
        .unwrap();

        let mut newer = new_region(2, b"", b"m");
        newer.region_epoch.version = 3;
        let leader = metapb::Peer { id: 2, store_id: 1 };
        pd.region_heartbeat(newer.clone(), leader, RegionStat::default())
            .unwrap();

        // A report with an older epoch must not clobber the newer view.
        pd.region_heartbeat(new_region(2, b"", b""), leader, RegionStat::default())
            .unwrap();
        assert_eq!(pd.get_region_by_id(2).unwrap().unwrap(), newer);
    }

    #[test]
    fn test_alloc_id_monotonic() {
        let pd = MockPdClient::new(1);
        let a = pd.alloc_id().unwrap();
        let b = pd.alloc_id().unwrap();
        assert!(b > a);
    }
}
