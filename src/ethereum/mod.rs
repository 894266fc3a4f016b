//! EVM RPC access: typed operations executed through a fault-tolerant
//! endpoint pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Filter, Log, TransactionReceipt, H256, U256,
};
use thiserror::Error;
use url::Url;

pub mod health;
pub mod pool;

use self::pool::EndpointPool;

/// The opaque per-endpoint client handle for EVM chains.
pub type EvmClient = Provider<Http>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    /// The queried object (typically a receipt) does not exist. Callers
    /// rely on telling this apart from endpoint failures.
    #[error("not found")]
    NotFound,

    #[error("endpoint reports chain id {actual}, expected {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    AllAttemptsFailed {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: Box<RpcError>,
    },
}

impl RpcError {
    fn from_provider(error: ProviderError) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Creates the opaque client handle for one endpoint URL. Bound at pool
/// construction so the pool itself stays chain-family agnostic.
#[async_trait]
pub trait ClientFactory<C>: Send + Sync {
    async fn create(&self, url: &Url) -> anyhow::Result<C>;
}

/// Plain HTTP JSON-RPC clients. Per-request timeouts are enforced by the
/// pool, not the transport.
pub struct HttpClientFactory;

#[async_trait]
impl ClientFactory<EvmClient> for HttpClientFactory {
    async fn create(&self, url: &Url) -> anyhow::Result<EvmClient> {
        let transport = Http::new(url.clone());
        Ok(Provider::new(transport))
    }
}

/// The RPC surface the pipeline consumes. Implemented by
/// [`PooledEthereum`] in production and by in-memory fakes in tests.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_block(&self) -> Result<u64, RpcError>;

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;

    /// `Err(RpcError::NotFound)` when the transaction is unknown to the
    /// endpoint — the confirmer's reorg signal.
    async fn transaction_receipt(&self, hash: H256) -> Result<TransactionReceipt, RpcError>;

    async fn gas_price(&self) -> Result<U256, RpcError>;

    async fn transaction_count(&self, address: Address, pending: bool) -> Result<U256, RpcError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError>;

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, RpcError>;
}

/// [`ChainRpc`] over an endpoint pool: every operation picks a healthy
/// endpoint and fails over per the pool policy.
#[derive(Clone)]
pub struct PooledEthereum {
    pool: Arc<EndpointPool<EvmClient>>,
}

impl PooledEthereum {
    #[must_use]
    pub fn new(pool: Arc<EndpointPool<EvmClient>>) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EndpointPool<EvmClient>> {
        &self.pool
    }
}

#[async_trait]
impl ChainRpc for PooledEthereum {
    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.pool
            .execute("eth_blockNumber", |client| async move {
                client
                    .get_block_number()
                    .await
                    .map(|n| n.as_u64())
                    .map_err(RpcError::from_provider)
            })
            .await
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let filter = filter.clone();
        self.pool
            .execute("eth_getLogs", move |client| {
                let filter = filter.clone();
                async move { client.get_logs(&filter).await.map_err(RpcError::from_provider) }
            })
            .await
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<TransactionReceipt, RpcError> {
        self.pool
            .execute("eth_getTransactionReceipt", move |client| async move {
                client
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(RpcError::from_provider)?
                    .ok_or(RpcError::NotFound)
            })
            .await
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        self.pool
            .execute("eth_gasPrice", |client| async move {
                client.get_gas_price().await.map_err(RpcError::from_provider)
            })
            .await
    }

    async fn transaction_count(&self, address: Address, pending: bool) -> Result<U256, RpcError> {
        let block: Option<BlockId> = Some(
            if pending {
                BlockNumber::Pending
            } else {
                BlockNumber::Latest
            }
            .into(),
        );
        self.pool
            .execute("eth_getTransactionCount", move |client| async move {
                client
                    .get_transaction_count(address, block)
                    .await
                    .map_err(RpcError::from_provider)
            })
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        let raw = raw.clone();
        self.pool
            .execute("eth_sendRawTransaction", move |client| {
                let raw = raw.clone();
                async move {
                    let pending = client
                        .send_raw_transaction(raw)
                        .await
                        .map_err(RpcError::from_provider)?;
                    Ok(*pending)
                }
            })
            .await
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, RpcError> {
        let tx = tx.clone();
        self.pool
            .execute("eth_call", move |client| {
                let tx = tx.clone();
                async move { client.call(&tx, None).await.map_err(RpcError::from_provider) }
            })
            .await
    }
}
