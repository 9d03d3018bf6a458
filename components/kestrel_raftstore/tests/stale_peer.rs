// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! An isolated peer that was removed behind its back: its stale vote is
//! answered with a tombstone and it destroys itself, never to return.

mod common;

use std::time::Duration;

use kestrel_engine::Peekable;
use kestrel_proto::raft_cmdpb::ConfChangeKind;
use kestrel_proto::raft_serverpb::{PeerState, RegionLocalState};
use kestrel_raftstore::keys;

use common::{wait_until, Cluster};

#[test]
fn test_stale_vote_gets_tombstone() {
    let cluster = Cluster::start(3);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    let store_ids: Vec<u64> = cluster.stores.iter().map(|s| s.store_id).collect();
    let mut added = Vec::new();
    for store_id in &store_ids[1..] {
        let peer = cluster.alloc_peer(*store_id);
        cluster.must_change_peer(region_id, ConfChangeKind::AddNode, peer);
        added.push(peer);
    }
    cluster.must_put(b"k", b"v");

    // Isolate the last added peer's store; make sure it holds a live
    // replica first.
    let victim = added[1];
    wait_until("victim replica is up", || {
        cluster.peer_view(victim.store_id, region_id).is_some()
    });
    cluster.trans.isolate(victim.store_id);

    // The majority removes the isolated peer; it never learns about it.
    cluster.must_change_peer(region_id, ConfChangeKind::RemoveNode, victim);
    cluster.must_put(b"k2", b"v2");
    assert!(cluster.peer_view(victim.store_id, region_id).is_some());

    // On reconnect the victim campaigns with its stale epoch. The
    // survivors answer with a tombstone and the victim destroys itself.
    cluster.trans.heal(victim.store_id);
    wait_until("stale peer destroyed itself", || {
        cluster.peer_view(victim.store_id, region_id).is_none()
    });

    let handle = cluster.store(victim.store_id);
    wait_until("tombstone written", || {
        matches!(
            handle
                .engines
                .kv
                .get_msg::<RegionLocalState>(&keys::region_state_key(region_id))
                .unwrap(),
            Some(RegionLocalState {
                state: PeerState::Tombstone,
                ..
            })
        )
    });

    // Destroyed peer finality: nothing recreates the pair.
    std::thread::sleep(Duration::from_millis(500));
    assert!(cluster.peer_view(victim.store_id, region_id).is_none());

    // The remaining majority is unharmed.
    cluster.must_put(b"k3", b"v3");
    assert_eq!(cluster.must_get(b"k3"), Some(b"v3".to_vec()));
}
