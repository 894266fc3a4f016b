//! Per-chain task tree: event listener, confirmer and gas oracle, spawned
//! with crash-retry backoff and torn down in a fixed order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::chain_id::ChainId;
use crate::config::ChainConfig;
use crate::database::ChainStore;
use crate::ethereum::ChainRpc;
use crate::shutdown::Shutdown;
use crate::utils::spawn_with_backoff;
use crate::vote::VoteHandler;

pub mod confirmer;
pub mod gas_oracle;
pub mod listener;

use self::confirmer::Confirmer;
use self::gas_oracle::GasOracle;
use self::listener::EventListener;

const EVENT_LISTENER_BACKOFF: Duration = Duration::from_secs(5);
const CONFIRMER_BACKOFF: Duration = Duration::from_secs(5);
const GAS_ORACLE_BACKOFF: Duration = Duration::from_secs(5);

struct RunningInstance {
    listener: Option<JoinHandle<()>>,
    confirmer: Option<JoinHandle<()>>,
    gas_oracle: Option<JoinHandle<()>>,
}

impl RunningInstance {
    /// Teardown order mirrors the pipeline: stop producing scan work
    /// first, then confirmation work, then the oracle.
    fn shutdown(self) {
        for handle in [self.listener, self.confirmer, self.gas_oracle]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Owns the long-running tasks of one chain.
pub struct ChainWorker<R, S> {
    chain: ChainId,
    config: ChainConfig,
    rpc: Arc<R>,
    store: Arc<S>,
    votes: Arc<dyn VoteHandler>,
    shutdown: Shutdown,
    instance: RwLock<Option<RunningInstance>>,
}

impl<R, S> ChainWorker<R, S>
where
    R: ChainRpc + 'static,
    S: ChainStore + 'static,
{
    pub fn new(
        config: ChainConfig,
        rpc: Arc<R>,
        store: Arc<S>,
        votes: Arc<dyn VoteHandler>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain: config.id,
            config,
            rpc,
            store,
            votes,
            shutdown,
            instance: RwLock::new(None),
        }
    }

    #[instrument(level = "debug", skip_all, fields(chain = %self.chain))]
    pub async fn start(&self) {
        let mut instance = self.instance.write().await;
        if instance.is_some() {
            warn!(chain = %self.chain, "Chain worker already running");
            return;
        }

        let listener = if self.config.inbound_enabled {
            let listener =
                EventListener::new(&self.config, self.rpc.clone(), self.store.clone());
            Some(spawn_with_backoff(
                move || listener.clone().run(),
                EVENT_LISTENER_BACKOFF,
                self.shutdown.clone(),
            ))
        } else {
            info!(chain = %self.chain, "Inbound observation disabled");
            None
        };

        let confirmer = if self.config.inbound_enabled {
            let confirmer = Confirmer::new(
                &self.config,
                self.rpc.clone(),
                self.store.clone(),
                self.votes.clone(),
            );
            Some(spawn_with_backoff(
                move || confirmer.clone().run(),
                CONFIRMER_BACKOFF,
                self.shutdown.clone(),
            ))
        } else {
            None
        };

        let gas_oracle = {
            let oracle = GasOracle::new(&self.config, self.rpc.clone(), self.votes.clone());
            Some(spawn_with_backoff(
                move || oracle.clone().run(),
                GAS_ORACLE_BACKOFF,
                self.shutdown.clone(),
            ))
        };

        info!(chain = %self.chain, "Chain worker started");
        *instance = Some(RunningInstance {
            listener,
            confirmer,
            gas_oracle,
        });
    }

    pub async fn shutdown(&self) {
        let mut instance = self.instance.write().await;
        if let Some(instance) = instance.take() {
            info!(chain = %self.chain, "Stopping chain worker");
            instance.shutdown();
        } else {
            info!(chain = %self.chain, "Chain worker not running");
        }
    }
}
