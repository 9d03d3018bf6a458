// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Split scenarios: the split checker carves an oversized region into
//! pieces whose ranges stay disjoint and together cover the parent.

mod common;

use kestrel_proto::metapb::Region;
use kestrel_util::config::ReadableSize;

use common::{wait_until, Cluster};

fn key_of(i: usize) -> Vec<u8> {
    format!("k{:04}", i).into_bytes()
}

fn collect_regions(cluster: &Cluster, store_id: u64) -> Vec<Region> {
    let handle = cluster.store(store_id);
    let mut regions = Vec::new();
    for region_id in handle.router.registered_regions() {
        if let Some((_, region, _)) = cluster.peer_view(store_id, region_id) {
            if region.is_initialized() {
                regions.push(region);
            }
        }
    }
    regions.sort_by(|a, b| a.start_key.cmp(&b.start_key));
    regions
}

/// Ranges must chain: start at "", each end key equal to the next start
/// key, and finish open-ended.
fn assert_covers_key_space(regions: &[Region]) {
    assert!(!regions.is_empty());
    assert!(regions[0].start_key.is_empty());
    for window in regions.windows(2) {
        assert_eq!(
            window[0].end_key, window[1].start_key,
            "ranges must be adjacent and disjoint: {:?}",
            regions
        );
    }
    assert!(regions.last().unwrap().end_key.is_empty());
}

#[test]
fn test_split_on_size() {
    let mut cfg = common::test_config();
    // Small limits so a few hundred KiB of writes trigger splitting.
    cfg.region_max_size = ReadableSize::kb(100);
    cfg.region_split_size = ReadableSize::kb(50);
    let cluster = Cluster::start_with_config(1, cfg);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    let value = vec![0u8; 1024];
    for i in 0..300 {
        cluster.must_put(&key_of(i), &value);
    }

    wait_until("split produced several regions", || {
        cluster.pd.region_count() >= 3
    });

    let store_id = cluster.stores[0].store_id;
    let regions = collect_regions(&cluster, store_id);
    assert!(regions.len() >= 3, "{:?}", regions);
    assert_covers_key_space(&regions);

    // The parent kept its id and its start key.
    let parent = &regions[0];
    assert_eq!(parent.id, region_id);
    // Split bumped the version on every piece.
    for region in &regions {
        assert!(region.region_epoch.version > 1, "{:?}", region);
    }

    // Keys on both sides of every split boundary stay readable.
    assert_eq!(cluster.must_get(&key_of(0)), Some(value.clone()));
    assert_eq!(cluster.must_get(&key_of(150)), Some(value.clone()));
    assert_eq!(cluster.must_get(&key_of(299)), Some(value.clone()));

    // And new writes land in the right pieces.
    cluster.must_put(b"k0000-new", b"left");
    cluster.must_put(b"k0299-new", b"right");
    assert_eq!(cluster.must_get(b"k0000-new"), Some(b"left".to_vec()));
    assert_eq!(cluster.must_get(b"k0299-new"), Some(b"right".to_vec()));
}

#[test]
fn test_split_mass_conservation() {
    let mut cfg = common::test_config();
    cfg.region_max_size = ReadableSize::kb(60);
    cfg.region_split_size = ReadableSize::kb(30);
    let cluster = Cluster::start_with_config(1, cfg);
    let region_id = cluster.first_region_id();
    cluster.wait_leader(region_id);

    let value = vec![1u8; 512];
    for i in 0..200 {
        cluster.must_put(&key_of(i), &value);
    }

    wait_until("split happened", || cluster.pd.region_count() >= 2);
    let store_id = cluster.stores[0].store_id;
    let regions = collect_regions(&cluster, store_id);
    assert_covers_key_space(&regions);

    // Every written key is still owned by exactly one region.
    for i in 0..200 {
        let key = key_of(i);
        let owners: Vec<&Region> = regions
            .iter()
            .filter(|r| {
                r.start_key.as_slice() <= key.as_slice()
                    && (r.end_key.is_empty() || key.as_slice() < r.end_key.as_slice())
            })
            .collect();
        assert_eq!(owners.len(), 1, "key {:?} owners {:?}", key, owners);
    }
    assert_eq!(cluster.must_get(&key_of(42)), Some(value.clone()));
    assert_eq!(cluster.must_get(&key_of(199)), Some(value));
}
