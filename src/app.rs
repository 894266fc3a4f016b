//! Top-level wiring: one endpoint pool and one task tree per configured
//! chain, over a shared database and vote handler.

use std::sync::Arc;

use ethers::types::Address;
use tracing::{info, instrument};

use crate::chain_id::ChainId;
use crate::config::Config;
use crate::database::Database;
use crate::ethereum::health::EvmHealthChecker;
use crate::ethereum::pool::EndpointPool;
use crate::ethereum::{EvmClient, HttpClientFactory, PooledEthereum};
use crate::outbound::broadcaster::OutboundExecutor;
use crate::outbound::SigningOracle;
use crate::shutdown::Shutdown;
use crate::vote::VoteHandler;
use crate::watcher::ChainWorker;

struct ChainRuntime {
    chain: ChainId,
    gateway: Address,
    outbound_enabled: bool,
    pool: Arc<EndpointPool<EvmClient>>,
    rpc: Arc<PooledEthereum>,
    worker: ChainWorker<PooledEthereum, Database>,
}

pub struct App {
    pub database: Arc<Database>,
    chains: Vec<ChainRuntime>,
}

impl App {
    /// Connects the database and every chain's endpoint pool. Chains
    /// whose endpoints all fail verification abort startup.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(
        config: Config,
        votes: Arc<dyn VoteHandler>,
        shutdown: Shutdown,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let database = Arc::new(Database::new(&config.database).await?);
        let factory = HttpClientFactory;

        let mut chains = Vec::new();
        for chain_config in &config.chains {
            let checker = Arc::new(EvmHealthChecker::new(chain_config.id.eip155()));
            let pool = EndpointPool::connect(
                chain_config.id,
                &chain_config.specific.rpc_urls,
                &factory,
                checker,
                config.rpc.clone(),
                shutdown.clone(),
            )
            .await?;
            pool.start_monitoring();

            let rpc = Arc::new(PooledEthereum::new(pool.clone()));
            let worker = ChainWorker::new(
                chain_config.clone(),
                rpc.clone(),
                database.clone(),
                votes.clone(),
                shutdown.clone(),
            );

            chains.push(ChainRuntime {
                chain: chain_config.id,
                gateway: chain_config.gateway,
                outbound_enabled: chain_config.outbound_enabled,
                pool,
                rpc,
                worker,
            });
        }

        info!(chains = chains.len(), "Validator initialized");
        Ok(Arc::new(Self { database, chains }))
    }

    pub async fn start(&self) {
        for chain in &self.chains {
            chain.worker.start().await;
        }
    }

    /// Outbound execution path for one chain; `None` when the chain is
    /// unknown or outbound is disabled for it.
    pub fn outbound_executor(
        &self,
        chain: ChainId,
        oracle: Arc<dyn SigningOracle>,
        signer: Address,
    ) -> Option<OutboundExecutor<PooledEthereum>> {
        let runtime = self
            .chains
            .iter()
            .find(|c| c.chain == chain && c.outbound_enabled)?;
        Some(OutboundExecutor::new(
            runtime.chain,
            runtime.gateway,
            runtime.rpc.clone(),
            oracle,
            signer,
        ))
    }

    /// Tear down every chain: pipeline tasks first, then the pool.
    pub async fn shutdown(&self) {
        for chain in &self.chains {
            chain.worker.shutdown().await;
            chain.pool.stop().await;
            info!(chain = %chain.chain, "Chain stopped");
        }
    }
}
