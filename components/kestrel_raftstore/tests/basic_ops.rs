// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Single-store smoke tests: commands travel the whole proposal → raft →
//! apply → callback path even with one voter.

mod common;

use common::Cluster;

#[test]
fn test_put_get_delete() {
    let cluster = Cluster::start(1);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    cluster.must_put(b"k1", b"v1");
    assert_eq!(cluster.must_get(b"k1"), Some(b"v1".to_vec()));
    assert_eq!(cluster.must_get(b"missing"), None);

    cluster.must_delete(b"k1");
    assert_eq!(cluster.must_get(b"k1"), None);
}

#[test]
fn test_overwrite_visible_in_order() {
    let cluster = Cluster::start(1);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    for i in 0..10u32 {
        cluster.must_put(b"counter", format!("{}", i).as_bytes());
    }
    assert_eq!(cluster.must_get(b"counter"), Some(b"9".to_vec()));
}

#[test]
fn test_write_survives_in_engine() {
    let cluster = Cluster::start(1);
    let region_id = cluster.first_region_id();
    let leader_store = cluster.wait_leader(region_id);

    cluster.must_put(b"durable", b"yes");

    // The data must be in the engine under the data prefix, and the apply
    // state must cover it in the same batch discipline.
    let handle = cluster.store(leader_store);
    common::wait_until("data visible in engine", || {
        use kestrel_engine::Peekable;
        handle
            .engines
            .kv
            .get_value(&kestrel_raftstore::keys::data_key(b"durable"))
            .unwrap()
            == Some(b"yes".to_vec())
    });
}
