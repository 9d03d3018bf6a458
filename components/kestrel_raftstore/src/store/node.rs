// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Store lifecycle against the placement driver: identity allocation,
//! cluster bootstrap, and startup/shutdown of the store system.

use std::sync::Arc;

use kestrel_engine::{Engines, Iterable, KvEngine, Peekable};
use kestrel_pd::PdClient;
use kestrel_proto::metapb;
use kestrel_proto::raft_serverpb::StoreIdent;
use slog::{info, warn, Logger};

use crate::keys;
use crate::store::bootstrap::{
    bootstrap_store, clear_prepare_bootstrap_cluster, clear_prepare_bootstrap_key, initial_region,
    prepare_bootstrap_cluster,
};
use crate::store::config::Config;
use crate::store::fsm::{create_raft_store, StoreSystem};
use crate::store::router::Router;
use crate::store::snap::SnapManager;
use crate::store::transport::Transport;
use crate::{Error, Result};

pub struct Node<EK: KvEngine, C: PdClient> {
    cluster_id: u64,
    store: metapb::Store,
    cfg: Arc<Config>,
    pd_client: Arc<C>,
    system: Option<StoreSystem<EK>>,
    logger: Logger,
}

impl<EK: KvEngine, C: PdClient> Node<EK, C> {
    pub fn new(cfg: Config, pd_client: Arc<C>, logger: Logger) -> Result<Node<EK, C>> {
        cfg.validate()?;
        let cluster_id = pd_client.get_cluster_id()?;
        let store = metapb::Store {
            id: 0,
            address: cfg.store_addr.clone(),
            state: metapb::StoreState::Up,
        };
        Ok(Node {
            cluster_id,
            store,
            cfg: Arc::new(cfg),
            pd_client,
            system: None,
            logger,
        })
    }

    pub fn id(&self) -> u64 {
        self.store.id
    }

    /// Brings the store up: allocates an id on first start, bootstraps the
    /// first region when this store wins the cluster-bootstrap race, and
    /// starts the store system.
    pub fn start<T: Transport>(
        &mut self,
        engines: Engines<EK>,
        trans: T,
        snap_mgr: SnapManager,
    ) -> Result<Router<EK>> {
        let mut store_id = self.check_store(&engines)?;
        if store_id == 0 {
            store_id = self.alloc_and_bootstrap_store(&engines)?;
        }
        self.store.id = store_id;
        info!(self.logger, "start store"; "store_id" => store_id);

        self.check_or_prepare_bootstrap_cluster(&engines, store_id)?;
        self.pd_client.put_store(self.store.clone())?;

        let (router, system) = create_raft_store(
            Arc::clone(&self.cfg),
            self.store.clone(),
            engines,
            trans,
            Arc::clone(&self.pd_client),
            snap_mgr,
            self.logger.clone(),
        )?;
        self.system = Some(system);
        Ok(router)
    }

    pub fn stop(&mut self) {
        if let Some(mut system) = self.system.take() {
            system.shutdown();
        }
    }

    /// Reads the store identity, verifying it belongs to this cluster.
    /// Returns 0 for a virgin store.
    fn check_store(&self, engines: &Engines<EK>) -> Result<u64> {
        match engines.kv.get_msg::<StoreIdent>(keys::STORE_IDENT_KEY)? {
            None => Ok(0),
            Some(ident) => {
                if ident.cluster_id != self.cluster_id {
                    return Err(Error::Other(kestrel_util::box_err!(
                        "cluster id mismatch, local {} != remote {}",
                        ident.cluster_id,
                        self.cluster_id
                    )));
                }
                if ident.store_id == 0 {
                    return Err(Error::Other("invalid zero store id".into()));
                }
                Ok(ident.store_id)
            }
        }
    }

    fn alloc_and_bootstrap_store(&self, engines: &Engines<EK>) -> Result<u64> {
        let store_id = self.pd_client.alloc_id()?;
        info!(self.logger, "alloc store id"; "store_id" => store_id);
        bootstrap_store(engines, self.cluster_id, store_id)?;
        Ok(store_id)
    }

    fn has_region_state(&self, engines: &Engines<EK>) -> Result<bool> {
        let mut found = false;
        engines.kv.scan(
            keys::REGION_META_MIN_KEY,
            keys::REGION_META_MAX_KEY,
            |_, _| {
                found = true;
                Ok(false)
            },
        )?;
        Ok(found)
    }

    fn check_or_prepare_bootstrap_cluster(
        &self,
        engines: &Engines<EK>,
        store_id: u64,
    ) -> Result<()> {
        // A leftover marker means the previous run crashed between
        // preparing and hearing back from the driver.
        if let Some(first_region) = engines
            .kv
            .get_msg::<metapb::Region>(keys::PREPARE_BOOTSTRAP_KEY)?
        {
            return self.bootstrap_cluster(engines, first_region);
        }
        if self.has_region_state(engines)? {
            return Ok(());
        }
        if self.pd_client.is_cluster_bootstrapped()? {
            // Another store carries the first region; this one fills up
            // through replication.
            return Ok(());
        }
        let region_id = self.pd_client.alloc_id()?;
        let peer_id = self.pd_client.alloc_id()?;
        info!(
            self.logger,
            "alloc first region";
            "region_id" => region_id,
            "peer_id" => peer_id,
        );
        let region = initial_region(store_id, region_id, peer_id);
        prepare_bootstrap_cluster(engines, &region)?;
        self.bootstrap_cluster(engines, region)
    }

    fn bootstrap_cluster(&self, engines: &Engines<EK>, first_region: metapb::Region) -> Result<()> {
        let region_id = first_region.id;
        match self
            .pd_client
            .bootstrap_cluster(self.store.clone(), first_region)
        {
            Ok(()) => {
                info!(self.logger, "cluster is bootstrapped"; "cluster_id" => self.cluster_id);
                clear_prepare_bootstrap_key(engines)?;
                Ok(())
            }
            Err(kestrel_pd::Error::ClusterBootstrapped(_)) => {
                // Lost the race; drop the prepared region entirely.
                warn!(self.logger, "cluster is already bootstrapped, clearing prepared region");
                clear_prepare_bootstrap_cluster(engines, region_id)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<EK: KvEngine, C: PdClient> Drop for Node<EK, C> {
    fn drop(&mut self) {
        self.stop();
    }
}
