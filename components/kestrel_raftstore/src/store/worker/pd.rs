// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Placement-driver worker: carries heartbeats and split negotiations off
//! the peer workers' critical path.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use kestrel_engine::KvEngine;
use kestrel_pd::{PdClient, RegionStat, StoreStats};
use kestrel_proto::metapb;
use kestrel_proto::raft_cmdpb::{
    AdminRequest, BatchSplitRequest, RaftCmdRequest, RaftRequestHeader, SplitRequest,
};
use kestrel_util::worker::Runnable;
use slog::{debug, error, info, Logger};

use crate::store::cmd_resp;
use crate::store::msg::{Callback, PeerMsg, RaftCommand};
use crate::store::router::Router;
use crate::store::util::KeysInfoFormatter;
use crate::Error;

pub enum PdTask<EK: KvEngine> {
    /// Asks the driver for new region/peer identities, then routes the
    /// resulting batch-split command back to the peer.
    AskBatchSplit {
        region: metapb::Region,
        split_keys: Vec<Vec<u8>>,
        peer: metapb::Peer,
        callback: Callback<EK>,
    },
    Heartbeat {
        region: metapb::Region,
        peer: metapb::Peer,
        pending_peers: Vec<metapb::Peer>,
        approximate_size: u64,
    },
    ReportBatchSplit {
        regions: Vec<metapb::Region>,
    },
    DestroyPeer {
        region_id: u64,
    },
    StoreHeartbeat {
        stats: StoreStats,
    },
}

impl<EK: KvEngine> Display for PdTask<EK> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PdTask::AskBatchSplit {
                region, split_keys, ..
            } => write!(
                f,
                "ask split region {} with {}",
                region.id,
                KeysInfoFormatter(split_keys.iter())
            ),
            PdTask::Heartbeat { region, peer, .. } => {
                write!(f, "heartbeat for region {}, leader {}", region.id, peer.id)
            }
            PdTask::ReportBatchSplit { regions } => {
                write!(f, "report split with {} regions", regions.len())
            }
            PdTask::DestroyPeer { region_id } => {
                write!(f, "destroy peer of region {}", region_id)
            }
            PdTask::StoreHeartbeat { stats } => {
                write!(f, "store heartbeat from store {}", stats.store_id)
            }
        }
    }
}

pub struct PdRunner<EK: KvEngine, C: PdClient> {
    store_id: u64,
    pd_client: Arc<C>,
    router: Router<EK>,
    logger: Logger,
}

impl<EK: KvEngine, C: PdClient> PdRunner<EK, C> {
    pub fn new(
        store_id: u64,
        pd_client: Arc<C>,
        router: Router<EK>,
        logger: Logger,
    ) -> PdRunner<EK, C> {
        PdRunner {
            store_id,
            pd_client,
            router,
            logger,
        }
    }

    fn handle_ask_batch_split(
        &self,
        region: metapb::Region,
        split_keys: Vec<Vec<u8>>,
        peer: metapb::Peer,
        callback: Callback<EK>,
    ) {
        if split_keys.is_empty() {
            callback.invoke_with_response(cmd_resp::new_error(Error::Other(
                "no split key is specified".into(),
            )));
            return;
        }
        let ids = match self.pd_client.ask_batch_split(region.clone(), split_keys.len()) {
            Ok(ids) => ids,
            Err(e) => {
                error!(
                    self.logger,
                    "ask batch split failed";
                    "region_id" => region.id,
                    "err" => %e,
                );
                callback.invoke_with_response(cmd_resp::new_error(e.into()));
                return;
            }
        };
        info!(
            self.logger,
            "try to batch split region";
            "region_id" => region.id,
            "new_region_ids" => ?ids.iter().map(|id| id.new_region_id).collect::<Vec<_>>(),
            "region" => ?region,
        );
        let requests = split_keys
            .into_iter()
            .zip(ids)
            .map(|(split_key, id)| SplitRequest {
                split_key,
                new_region_id: id.new_region_id,
                new_peer_ids: id.new_peer_ids,
            })
            .collect();
        let req = RaftCmdRequest {
            header: RaftRequestHeader {
                region_id: region.id,
                peer,
                region_epoch: region.region_epoch,
                term: 0,
            },
            requests: vec![],
            admin_request: Some(AdminRequest::Splits(BatchSplitRequest { requests })),
        };
        if let Err(e) = self
            .router
            .send(region.id, PeerMsg::RaftCommand(RaftCommand::new(req, callback)))
        {
            error!(
                self.logger,
                "failed to send split command";
                "region_id" => region.id,
                "err" => ?e,
            );
            if let crossbeam::channel::TrySendError::Full(PeerMsg::RaftCommand(cmd))
            | crossbeam::channel::TrySendError::Disconnected(PeerMsg::RaftCommand(cmd)) = e
            {
                cmd.callback
                    .invoke_with_response(cmd_resp::new_error(Error::RegionNotFound(region.id)));
            }
        }
    }
}

impl<EK: KvEngine, C: PdClient> Runnable<PdTask<EK>> for PdRunner<EK, C> {
    fn run(&mut self, task: PdTask<EK>) {
        match task {
            PdTask::AskBatchSplit {
                region,
                split_keys,
                peer,
                callback,
            } => self.handle_ask_batch_split(region, split_keys, peer, callback),
            PdTask::Heartbeat {
                region,
                peer,
                pending_peers,
                approximate_size,
            } => {
                let stat = RegionStat {
                    approximate_size,
                    pending_peers,
                };
                if let Err(e) = self.pd_client.region_heartbeat(region.clone(), peer, stat) {
                    debug!(
                        self.logger,
                        "region heartbeat failed";
                        "region_id" => region.id,
                        "err" => %e,
                    );
                }
            }
            PdTask::ReportBatchSplit { regions } => {
                if let Err(e) = self.pd_client.report_batch_split(regions) {
                    debug!(self.logger, "report batch split failed"; "err" => %e);
                }
            }
            PdTask::DestroyPeer { region_id } => {
                info!(
                    self.logger,
                    "peer destroyed, stop reporting";
                    "region_id" => region_id,
                    "store_id" => self.store_id,
                );
            }
            PdTask::StoreHeartbeat { stats } => {
                if let Err(e) = self.pd_client.store_heartbeat(stats) {
                    debug!(self.logger, "store heartbeat failed"; "err" => %e);
                }
            }
        }
    }
}
