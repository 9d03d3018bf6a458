// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Three-voter cluster: one leader emerges, writes go through it, and
//! followers refuse client commands with a leader hint.

mod common;

use kestrel_proto::errorpb::ErrorDetail;
use kestrel_proto::raft_cmdpb::{ConfChangeKind, RaftCmdRequest, RaftRequestHeader, Request};
use kestrel_raftstore::keys;
use kestrel_pd::PdClient;

use common::{wait_until, Cluster, CF_DEFAULT};

fn replicate_everywhere(cluster: &Cluster, region_id: u64) {
    let store_ids: Vec<u64> = cluster.stores.iter().map(|s| s.store_id).collect();
    for store_id in &store_ids[1..] {
        let peer = cluster.alloc_peer(*store_id);
        cluster.must_change_peer(region_id, ConfChangeKind::AddNode, peer);
    }
}

#[test]
fn test_leader_election_and_first_write() {
    let cluster = Cluster::start(3);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);
    replicate_everywhere(&cluster, region_id);

    // Exactly one leader, and the write is visible through it.
    let leader_store = cluster.wait_leader(region_id);
    cluster.must_put(b"k", b"v");
    assert_eq!(cluster.must_get(b"k"), Some(b"v".to_vec()));

    // Replication catches every store's engine up eventually.
    for handle in &cluster.stores {
        wait_until("replicated to all stores", || {
            use kestrel_engine::Peekable;
            handle
                .engines
                .kv
                .get_value(&keys::data_key(b"k"))
                .unwrap()
                == Some(b"v".to_vec())
        });
    }

    // A follower answers NotLeader with a hint at the real leader.
    let follower_store = cluster
        .stores
        .iter()
        .map(|s| s.store_id)
        .find(|id| *id != leader_store)
        .unwrap();
    let (peer, region, _) = cluster.peer_view(follower_store, region_id).unwrap();
    let req = RaftCmdRequest {
        header: RaftRequestHeader {
            region_id,
            peer,
            region_epoch: region.region_epoch,
            term: 0,
        },
        requests: vec![Request::Get {
            cf: CF_DEFAULT.to_owned(),
            key: b"k".to_vec(),
        }],
        admin_request: None,
    };
    let resp = cluster.call_command(follower_store, req, true).unwrap();
    match resp.header.error.as_ref().and_then(|e| e.detail.as_ref()) {
        Some(ErrorDetail::NotLeader { region_id: id, leader }) => {
            assert_eq!(*id, region_id);
            if let Some(leader) = leader {
                assert_eq!(leader.store_id, leader_store);
            }
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[test]
fn test_transfer_leader() {
    let cluster = Cluster::start(3);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);
    replicate_everywhere(&cluster, region_id);
    cluster.must_put(b"k", b"v");

    let leader_store = cluster.wait_leader(region_id);
    let target_store = cluster
        .stores
        .iter()
        .map(|s| s.store_id)
        .find(|id| *id != leader_store)
        .unwrap();
    let (target_peer, _, _) = cluster.peer_view(target_store, region_id).unwrap();

    cluster.must_transfer_leader(region_id, target_peer);
    assert_eq!(cluster.wait_leader(region_id), target_store);

    // The new leader serves reads and writes.
    cluster.must_put(b"k-after-transfer", b"v2");
    assert_eq!(cluster.must_get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_epoch_monotonic_through_conf_changes() {
    let cluster = Cluster::start(3);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    let mut last_conf_ver = 0;
    let store_ids: Vec<u64> = cluster.stores.iter().map(|s| s.store_id).collect();
    for store_id in &store_ids[1..] {
        let peer = cluster.alloc_peer(*store_id);
        cluster.must_change_peer(region_id, ConfChangeKind::AddNode, peer);
        let region = cluster.pd.get_region_by_id(region_id).unwrap().unwrap();
        assert!(region.region_epoch.conf_ver > last_conf_ver);
        last_conf_ver = region.region_epoch.conf_ver;
    }
}
