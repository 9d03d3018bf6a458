// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use kestrel_util::config::{ReadableDuration, ReadableSize};

use crate::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Address this store advertises to peers and the placement driver.
    pub store_addr: String,
    /// Placement driver address. Unused in single-node mode.
    pub pd_addr: String,
    /// Replicated mode. When false the store runs against an in-process
    /// placement stub with a single voter per region.
    pub raft: bool,
    pub data_dir: String,
    pub log_level: String,

    // raft_base_tick_interval is a base tick interval (ms).
    pub raft_base_tick_interval: ReadableDuration,
    pub raft_heartbeat_ticks: usize,
    pub raft_election_timeout_ticks: usize,
    pub raft_max_size_per_msg: ReadableSize,
    pub raft_max_inflight_msgs: usize,
    // When the entry exceed the max size, reject to propose it.
    pub raft_entry_max_size: ReadableSize,

    // Interval to gc unnecessary raft log.
    pub raft_log_gc_tick_interval: ReadableDuration,
    // When entry count exceed this value, gc will be forced trigger.
    pub raft_log_gc_count_limit: u64,

    // Interval to check region whether need to be split or not.
    pub split_region_check_tick_interval: ReadableDuration,
    /// When region size exceeds this value it is split.
    pub region_max_size: ReadableSize,
    /// Target size of the pieces a region is split into.
    pub region_split_size: ReadableSize,

    pub pd_heartbeat_tick_interval: ReadableDuration,
    pub pd_store_heartbeat_tick_interval: ReadableDuration,

    pub snap_mgr_gc_tick_interval: ReadableDuration,
    /// A sending snapshot file untouched for longer than this is assumed
    /// abandoned and collected.
    pub snap_gc_timeout: ReadableDuration,

    pub notify_capacity: usize,
    pub messages_per_tick: usize,

    pub peer_pool_size: usize,
    pub apply_pool_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            store_addr: "127.0.0.1:20160".to_owned(),
            pd_addr: "127.0.0.1:2379".to_owned(),
            raft: true,
            data_dir: "/tmp/kestrel".to_owned(),
            log_level: "info".to_owned(),
            raft_base_tick_interval: ReadableDuration::secs(1),
            raft_heartbeat_ticks: 2,
            raft_election_timeout_ticks: 10,
            raft_max_size_per_msg: ReadableSize::mb(1),
            raft_max_inflight_msgs: 256,
            raft_entry_max_size: ReadableSize::mb(8),
            raft_log_gc_tick_interval: ReadableDuration::secs(10),
            raft_log_gc_count_limit: 72 * 1024,
            split_region_check_tick_interval: ReadableDuration::secs(10),
            region_max_size: ReadableSize::mb(144),
            region_split_size: ReadableSize::mb(96),
            pd_heartbeat_tick_interval: ReadableDuration::secs(10),
            pd_store_heartbeat_tick_interval: ReadableDuration::secs(10),
            snap_mgr_gc_tick_interval: ReadableDuration::minutes(1),
            snap_gc_timeout: ReadableDuration::hours(4),
            notify_capacity: 40960,
            messages_per_tick: 4096,
            peer_pool_size: 2,
            apply_pool_size: 2,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.store_addr.is_empty() {
            return Err(Error::Other("store-addr can not be empty".into()));
        }
        if self.raft && self.pd_addr.is_empty() {
            return Err(Error::Other(
                "pd-addr can not be empty in replicated mode".into(),
            ));
        }
        if self.raft_base_tick_interval.is_zero() {
            return Err(Error::Other("raft-base-tick-interval can not be 0".into()));
        }
        if self.raft_heartbeat_ticks == 0 {
            return Err(Error::Other("raft-heartbeat-ticks can not be 0".into()));
        }
        if self.raft_election_timeout_ticks < 2 * self.raft_heartbeat_ticks {
            return Err(Error::Other(
                "election tick must be greater than twice the heartbeat tick".into(),
            ));
        }
        if self.raft_log_gc_count_limit == 0 {
            return Err(Error::Other(
                "raft-log-gc-count-limit can not be 0".into(),
            ));
        }
        if self.region_max_size.0 < self.region_split_size.0 {
            return Err(Error::Other(
                "region-max-size must be greater than region-split-size".into(),
            ));
        }
        if self.peer_pool_size == 0 || self.apply_pool_size == 0 {
            return Err(Error::Other("worker pool sizes can not be 0".into()));
        }
        if self.messages_per_tick == 0 || self.notify_capacity == 0 {
            return Err(Error::Other(
                "notify-capacity and messages-per-tick can not be 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validate() {
        let mut cfg = Config::default();
        cfg.validate().unwrap();

        cfg.store_addr = "".to_owned();
        cfg.validate().unwrap_err();

        let mut cfg = Config::default();
        cfg.raft_election_timeout_ticks = 3;
        cfg.validate().unwrap_err();

        let mut cfg = Config::default();
        cfg.region_max_size = ReadableSize::mb(10);
        cfg.region_split_size = ReadableSize::mb(20);
        cfg.validate().unwrap_err();

        // Single-node mode tolerates a missing pd address.
        let mut cfg = Config::default();
        cfg.pd_addr = "".to_owned();
        cfg.validate().unwrap_err();
        cfg.raft = false;
        cfg.validate().unwrap();
    }
}
