// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Split-check worker: scans a region to estimate its size and propose
//! split keys.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use kestrel_engine::{Iterable, KvEngine, CF_DEFAULT};
use kestrel_proto::metapb::Region;
use kestrel_util::worker::Runnable;
use slog::{debug, info, warn, Logger};

use crate::keys::{self, enc_end_key, enc_start_key};
use crate::store::config::Config;
use crate::store::msg::{Callback, PeerMsg};
use crate::store::router::Router;

pub struct SplitCheckTask {
    pub region: Region,
}

impl Display for SplitCheckTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Split Check Task for region {}", self.region.id)
    }
}

pub struct SplitCheckRunner<EK: KvEngine> {
    engine: EK,
    router: Router<EK>,
    cfg: Arc<Config>,
    logger: Logger,
}

impl<EK: KvEngine> SplitCheckRunner<EK> {
    pub fn new(
        engine: EK,
        router: Router<EK>,
        cfg: Arc<Config>,
        logger: Logger,
    ) -> SplitCheckRunner<EK> {
        SplitCheckRunner {
            engine,
            router,
            cfg,
            logger,
        }
    }

    /// Walks the region's data and returns its total size together with a
    /// split key at every `region_split_size` boundary. Keys are only
    /// produced when the region has outgrown `region_max_size`.
    fn scan_region(&self, region: &Region) -> (u64, Vec<Vec<u8>>) {
        let split_size = self.cfg.region_split_size.0;
        let mut total_size = 0u64;
        let mut split_keys = Vec::new();
        let mut next_boundary = split_size;
        let (start, end) = (enc_start_key(region), enc_end_key(region));
        let res = self.engine.scan_cf(CF_DEFAULT, &start, &end, |k, v| {
            total_size += (k.len() - 1 + v.len()) as u64;
            if total_size >= next_boundary {
                split_keys.push(keys::origin_key(k).to_vec());
                next_boundary += split_size;
            }
            Ok(true)
        });
        if let Err(e) = res {
            warn!(
                self.logger,
                "failed to scan region for split check";
                "region_id" => region.id,
                "err" => %e,
            );
            return (0, vec![]);
        }
        if total_size < self.cfg.region_max_size.0 {
            return (total_size, vec![]);
        }
        // The tail after the last boundary stays with the right-most
        // region; a boundary exactly at the region end produces an empty
        // piece and is dropped.
        if let Some(last) = split_keys.last() {
            if last.as_slice() >= region.end_key.as_slice() && !region.end_key.is_empty() {
                split_keys.pop();
            }
        }
        (total_size, split_keys)
    }
}

impl<EK: KvEngine> Runnable<SplitCheckTask> for SplitCheckRunner<EK> {
    fn run(&mut self, task: SplitCheckTask) {
        let region = task.region;
        let (size, split_keys) = self.scan_region(&region);
        debug!(
            self.logger,
            "split check finished";
            "region_id" => region.id,
            "size" => size,
            "split_keys" => split_keys.len(),
        );

        if self
            .router
            .send(region.id, PeerMsg::ApproximateRegionSize(size))
            .is_err()
        {
            // The peer is gone; nothing to report.
            return;
        }

        if split_keys.is_empty() {
            return;
        }
        info!(
            self.logger,
            "region needs split";
            "region_id" => region.id,
            "size" => size,
            "split_keys" => split_keys.len(),
        );
        let msg = PeerMsg::SplitRegion {
            region_epoch: region.region_epoch,
            split_keys,
            callback: Callback::None,
        };
        if let Err(e) = self.router.send(region.id, msg) {
            warn!(
                self.logger,
                "failed to send split request";
                "region_id" => region.id,
                "err" => ?e,
            );
        }
    }
}
