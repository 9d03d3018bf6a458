// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use kestrel_engine::{Engines, Iterable, KvEngine, Mutable};
use kestrel_proto::metapb;
use kestrel_proto::raft_serverpb::{PeerState, StoreIdent};

use crate::keys;
use crate::store::peer_storage::{
    write_initial_apply_state, write_initial_raft_state, write_peer_state,
};
use crate::{Error, Result};

pub const INIT_EPOCH_VER: u64 = 1;
pub const INIT_EPOCH_CONF_VER: u64 = 1;

/// The whole key space, owned by the first region of a fresh cluster.
pub fn initial_region(store_id: u64, region_id: u64, peer_id: u64) -> metapb::Region {
    metapb::Region {
        id: region_id,
        region_epoch: metapb::RegionEpoch {
            conf_ver: INIT_EPOCH_CONF_VER,
            version: INIT_EPOCH_VER,
        },
        peers: vec![metapb::Peer {
            id: peer_id,
            store_id,
        }],
        ..Default::default()
    }
}

fn is_range_empty<EK: KvEngine>(engine: &EK, start_key: &[u8], end_key: &[u8]) -> Result<bool> {
    let mut count: u32 = 0;
    engine.scan(start_key, end_key, |_, _| {
        count += 1;
        Ok(false)
    })?;
    Ok(count == 0)
}

/// Stamps a virgin store with its identity. Refuses to touch a store that
/// already holds region metadata.
pub fn bootstrap_store<EK: KvEngine>(
    engines: &Engines<EK>,
    cluster_id: u64,
    store_id: u64,
) -> Result<()> {
    let mut ident = StoreIdent::default();
    if !is_range_empty(&engines.kv, keys::MIN_KEY, keys::MAX_KEY)? {
        return Err(Error::Other("kv store is not empty and has already had data".into()));
    }
    ident.cluster_id = cluster_id;
    ident.store_id = store_id;
    let mut wb = engines.kv.write_batch();
    wb.put_msg(keys::STORE_IDENT_KEY, &ident)?;
    engines.write_kv(&wb)?;
    Ok(())
}

/// Writes the first region's states plus a marker that the cluster-level
/// bootstrap has not been acknowledged by the placement driver yet.
pub fn prepare_bootstrap_cluster<EK: KvEngine>(
    engines: &Engines<EK>,
    region: &metapb::Region,
) -> Result<()> {
    let mut kv_wb = engines.kv.write_batch();
    kv_wb.put_msg(keys::PREPARE_BOOTSTRAP_KEY, region)?;
    write_peer_state(&mut kv_wb, region, PeerState::Normal)?;
    write_initial_apply_state(&mut kv_wb, region.id)?;
    engines.write_kv(&kv_wb)?;

    let mut raft_wb = engines.raft.write_batch();
    write_initial_raft_state(&mut raft_wb, region.id)?;
    engines.write_raft(&raft_wb)?;
    Ok(())
}

/// Undoes `prepare_bootstrap_cluster` after losing the bootstrap race.
pub fn clear_prepare_bootstrap_cluster<EK: KvEngine>(
    engines: &Engines<EK>,
    region_id: u64,
) -> Result<()> {
    let mut raft_wb = engines.raft.write_batch();
    raft_wb.delete(&keys::raft_state_key(region_id))?;
    engines.write_raft(&raft_wb)?;

    let mut kv_wb = engines.kv.write_batch();
    kv_wb.delete(keys::PREPARE_BOOTSTRAP_KEY)?;
    kv_wb.delete(&keys::region_state_key(region_id))?;
    kv_wb.delete(&keys::apply_state_key(region_id))?;
    engines.write_kv(&kv_wb)?;
    Ok(())
}

/// Drops only the marker once the placement driver acknowledged the
/// bootstrap.
pub fn clear_prepare_bootstrap_key<EK: KvEngine>(engines: &Engines<EK>) -> Result<()> {
    let mut wb = engines.kv.write_batch();
    wb.delete(keys::PREPARE_BOOTSTRAP_KEY)?;
    engines.write_kv(&wb)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_engine::{MemEngine, Peekable};

    #[test]
    fn test_bootstrap_and_rollback() {
        let engines = Engines::new(MemEngine::new(), MemEngine::new());
        bootstrap_store(&engines, 1, 1).unwrap();
        // A second bootstrap must refuse: the ident is data.
        bootstrap_store(&engines, 1, 1).unwrap_err();

        let region = initial_region(1, 2, 3);
        prepare_bootstrap_cluster(&engines, &region).unwrap();
        assert!(engines
            .kv
            .get_msg::<metapb::Region>(keys::PREPARE_BOOTSTRAP_KEY)
            .unwrap()
            .is_some());
        assert!(engines
            .kv
            .get_value(&keys::region_state_key(2))
            .unwrap()
            .is_some());

        clear_prepare_bootstrap_cluster(&engines, 2).unwrap();
        assert!(engines
            .kv
            .get_msg::<metapb::Region>(keys::PREPARE_BOOTSTRAP_KEY)
            .unwrap()
            .is_none());
        assert!(engines
            .kv
            .get_value(&keys::region_state_key(2))
            .unwrap()
            .is_none());
        assert!(engines
            .raft
            .get_value(&keys::raft_state_key(2))
            .unwrap()
            .is_none());
    }
}
