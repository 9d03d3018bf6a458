// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Removing a peer destroys it on its store: engine wiped, tombstone
//! written, and no later message revives it.

mod common;

use std::time::Duration;

use kestrel_engine::{Iterable, Peekable};
use kestrel_proto::raft_cmdpb::ConfChangeKind;
use kestrel_proto::raft_serverpb::{PeerState, RaftMessage, RegionLocalState};
use kestrel_raftstore::keys;

use common::{wait_until, Cluster};

#[test]
fn test_remove_peer_destroys_it() {
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

    // Make sure the victim is not the leader; the leader would destroy
    // itself only after stepping down.
    let victim = added[1];
    let leader_store = cluster.wait_leader(region_id);
    assert_ne!(leader_store, victim.store_id);

    wait_until("victim peer exists", || {
        cluster.peer_view(victim.store_id, region_id).is_some()
    });
    cluster.must_change_peer(region_id, ConfChangeKind::RemoveNode, victim);

    // The peer disappears from the router.
    wait_until("peer closed", || {
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

    // The data range of the region is wiped on the removed store.
    wait_until("data wiped", || {
        let mut empty = true;
        handle
            .engines
            .kv
            .scan(keys::DATA_MIN_KEY, keys::DATA_MAX_KEY, |_, _| {
                empty = false;
                Ok(false)
            })
            .unwrap();
        empty
    });
    // Raft metadata is gone too.
    assert!(handle
        .engines
        .raft
        .get_value(&keys::raft_state_key(region_id))
        .unwrap()
        .is_none());

    // A straggler message addressed to the destroyed peer must not
    // recreate it.
    let (leader_peer, region, _) = cluster.peer_view(leader_store, region_id).unwrap();
    let mut msg = raft::eraftpb::Message::default();
    msg.set_msg_type(raft::eraftpb::MessageType::MsgHeartbeat);
    msg.set_from(leader_peer.id);
    msg.set_to(victim.id);
    let raft_msg = RaftMessage {
        region_id,
        from_peer: leader_peer,
        to_peer: victim,
        region_epoch: Some(region.region_epoch),
        message: msg,
        is_tombstone: false,
        start_key: region.start_key.clone(),
        end_key: region.end_key.clone(),
    };
    handle.router.send_raft_message(raft_msg).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert!(cluster.peer_view(victim.store_id, region_id).is_none());

    // The survivors keep serving.
    cluster.must_put(b"k2", b"v2");
    assert_eq!(cluster.must_get(b"k2"), Some(b"v2".to_vec()));
}
