// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Per-peer (and per-store) logical clock.
//!
//! The tick driver delivers one `Tick` message per base interval; the
//! ticker turns that stream into per-kind deadlines. A tick kind fires
//! when the clock reaches its deadline and stays silent until it is
//! scheduled again, so handlers decide themselves whether an event
//! repeats.

use crate::store::config::Config;
use crate::store::msg::{PeerTick, StoreTick, PEER_TICK_COUNT, STORE_TICK_COUNT};

#[derive(Clone, Copy, Debug)]
struct TickSchedule {
    run_at: u64,
    interval: u64,
}

pub struct Ticker {
    tick: u64,
    schedules: Vec<TickSchedule>,
}

fn ticks_of(cfg: &Config, interval_ms: u64) -> u64 {
    let base = cfg.raft_base_tick_interval.as_millis().max(1);
    (interval_ms / base).max(1)
}

impl Ticker {
    pub fn new(cfg: &Config) -> Ticker {
        let intervals = [
            1, // raft
            ticks_of(cfg, cfg.raft_log_gc_tick_interval.as_millis()),
            ticks_of(cfg, cfg.split_region_check_tick_interval.as_millis()),
            ticks_of(cfg, cfg.pd_heartbeat_tick_interval.as_millis()),
        ];
        debug_assert_eq!(intervals.len(), PEER_TICK_COUNT);
        Ticker::with_intervals(&intervals)
    }

    pub fn new_store(cfg: &Config) -> Ticker {
        let intervals = [
            ticks_of(cfg, cfg.snap_mgr_gc_tick_interval.as_millis()),
            ticks_of(cfg, cfg.pd_store_heartbeat_tick_interval.as_millis()),
        ];
        debug_assert_eq!(intervals.len(), STORE_TICK_COUNT);
        Ticker::with_intervals(&intervals)
    }

    fn with_intervals(intervals: &[u64]) -> Ticker {
        Ticker {
            tick: 0,
            schedules: intervals
                .iter()
                .map(|i| TickSchedule {
                    run_at: u64::MAX,
                    interval: *i,
                })
                .collect(),
        }
    }

    pub fn tick_clock(&mut self) {
        self.tick += 1;
    }

    fn schedule_at(&mut self, idx: usize) {
        let sched = &mut self.schedules[idx];
        sched.run_at = self.tick + sched.interval;
    }

    fn is_on_tick_at(&self, idx: usize) -> bool {
        self.schedules[idx].run_at == self.tick
    }

    pub fn schedule(&mut self, tick: PeerTick) {
        self.schedule_at(tick as usize);
    }

    pub fn is_on_tick(&self, tick: PeerTick) -> bool {
        self.is_on_tick_at(tick as usize)
    }

    pub fn schedule_store(&mut self, tick: StoreTick) {
        self.schedule_at(tick as usize);
    }

    pub fn is_on_store_tick(&self, tick: StoreTick) -> bool {
        self.is_on_tick_at(tick as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_util::config::ReadableDuration;

    fn test_config() -> Config {
        Config {
            raft_base_tick_interval: ReadableDuration::millis(10),
            raft_log_gc_tick_interval: ReadableDuration::millis(30),
            ..Default::default()
        }
    }

    #[test]
    fn test_tick_fires_once_per_schedule() {
        let cfg = test_config();
        let mut ticker = Ticker::new(&cfg);
        ticker.schedule(PeerTick::Raft);

        ticker.tick_clock();
        assert!(ticker.is_on_tick(PeerTick::Raft));
        // Not rescheduled, so the next tick is silent.
        ticker.tick_clock();
        assert!(!ticker.is_on_tick(PeerTick::Raft));
    }

    #[test]
    fn test_interval_multiples() {
        let cfg = test_config();
        let mut ticker = Ticker::new(&cfg);
        ticker.schedule(PeerTick::RaftLogGc);
        for _ in 0..2 {
            ticker.tick_clock();
            assert!(!ticker.is_on_tick(PeerTick::RaftLogGc));
        }
        ticker.tick_clock();
        assert!(ticker.is_on_tick(PeerTick::RaftLogGc));
    }

    #[test]
    fn test_unscheduled_kind_never_fires() {
        let cfg = test_config();
        let mut ticker = Ticker::new(&cfg);
        for _ in 0..100 {
            ticker.tick_clock();
            assert!(!ticker.is_on_tick(PeerTick::PdHeartbeat));
        }
    }
}
