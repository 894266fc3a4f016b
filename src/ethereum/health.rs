use async_trait::async_trait;
use ethers::providers::Middleware;

use super::{EvmClient, RpcError};

/// Chain-family specific endpoint probing, bound at pool construction.
#[async_trait]
pub trait HealthChecker<C>: Send + Sync {
    /// Periodic liveness probe run by the pool's health monitor.
    async fn check(&self, client: &C) -> Result<(), RpcError>;

    /// One-time identity verification at pool construction. An endpoint
    /// that fails this is excluded outright rather than marked unhealthy.
    async fn verify_chain(&self, client: &C) -> Result<(), RpcError>;
}

/// Default EVM probe: the endpoint must report a non-zero head and the
/// configured chain id.
pub struct EvmHealthChecker {
    chain_id: u64,
}

impl EvmHealthChecker {
    #[must_use]
    pub const fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }
}

#[async_trait]
impl HealthChecker<EvmClient> for EvmHealthChecker {
    async fn check(&self, client: &EvmClient) -> Result<(), RpcError> {
        let block = client
            .get_block_number()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if block.is_zero() {
            return Err(RpcError::Transport(
                "endpoint reports block height 0".to_owned(),
            ));
        }
        self.verify_chain(client).await
    }

    async fn verify_chain(&self, client: &EvmClient) -> Result<(), RpcError> {
        let chain_id = client
            .get_chainid()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if chain_id != self.chain_id.into() {
            return Err(RpcError::ChainIdMismatch {
                expected: self.chain_id,
                actual: chain_id.low_u64(),
            });
        }
        Ok(())
    }
}
