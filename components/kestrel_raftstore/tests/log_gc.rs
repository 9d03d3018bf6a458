// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Log compaction: once enough entries pile up past the first index, the
//! leader proposes a truncation up to `applied - 1` and the GC worker
//! deletes the raft engine range.

mod common;

use kestrel_engine::Peekable;
use kestrel_raftstore::keys;

use common::{wait_until, Cluster};

#[test]
fn test_log_gc_truncates_engine() {
    let mut cfg = common::test_config();
    cfg.raft_log_gc_count_limit = 10;
    let cluster = Cluster::start_with_config(1, cfg);
    let region_id = cluster.first_region_id();
    let leader_store = cluster.wait_leader(region_id);

    for i in 0..50u32 {
        cluster.must_put(format!("k{}", i).as_bytes(), b"v");
    }

    let truncated = || {
        let handle = cluster.store(leader_store);
        let state = handle.router.get(region_id).unwrap();
        let fsm = state.peer.lock().unwrap();
        (
            fsm.peer.get_store().truncated_index(),
            fsm.peer.get_store().applied_index(),
            fsm.peer.get_store().first_index(),
        )
    };

    wait_until("log got truncated", || truncated().0 > 10);

    let (truncated_idx, applied_idx, first_idx) = truncated();
    // Truncation never outruns `applied - 1`.
    assert!(truncated_idx < applied_idx);
    assert_eq!(first_idx, truncated_idx + 1);

    // The GC worker really deletes the range from the raft engine.
    let handle = cluster.store(leader_store);
    wait_until("compacted entries deleted", || {
        handle
            .engines
            .raft
            .get_value(&keys::raft_log_key(region_id, truncated_idx))
            .unwrap()
            .is_none()
    });
    // Entries after the truncation point survive.
    assert!(handle
        .engines
        .raft
        .get_value(&keys::raft_log_key(region_id, truncated_idx + 1))
        .unwrap()
        .is_some());

    // The store keeps serving reads and writes afterwards.
    cluster.must_put(b"after-gc", b"ok");
    assert_eq!(cluster.must_get(b"after-gc"), Some(b"ok".to_vec()));
}

#[test]
fn test_log_gc_skipped_below_limit() {
    let mut cfg = common::test_config();
    cfg.raft_log_gc_count_limit = 100_000;
    let cluster = Cluster::start_with_config(1, cfg);
    let region_id = cluster.first_region_id();
    let leader_store = cluster.wait_leader(region_id);

    for i in 0..20u32 {
        cluster.must_put(format!("k{}", i).as_bytes(), b"v");
    }
    std::thread::sleep(std::time::Duration::from_millis(500));

    let handle = cluster.store(leader_store);
    let state = handle.router.get(region_id).unwrap();
    let fsm = state.peer.lock().unwrap();
    // Below the gc count limit nothing is truncated beyond the bootstrap
    // position.
    assert_eq!(
        fsm.peer.get_store().truncated_index(),
        kestrel_raftstore::store::RAFT_INIT_LOG_INDEX
    );
}
