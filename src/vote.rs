use async_trait::async_trait;
use ethers::types::U256;
use tracing::info;

use crate::chain_id::ChainId;
use crate::event::Event;

/// Reports confirmed events and gas-price samples to the internal chain.
///
/// The receiver is idempotent; an `Ok` return is the acknowledgement that
/// lets the confirmer advance `AwaitingVote → VoteSubmitted → Completed`.
#[async_trait]
pub trait VoteHandler: Send + Sync {
    async fn submit_event(&self, event: &Event) -> anyhow::Result<()>;

    async fn submit_gas_price(
        &self,
        chain: ChainId,
        price_wei: U256,
        block: u64,
    ) -> anyhow::Result<()>;
}

/// Acknowledges every vote with a log line. Stands in for the internal
/// chain client in dry runs.
pub struct LogVoteHandler;

#[async_trait]
impl VoteHandler for LogVoteHandler {
    async fn submit_event(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            event = %event.id,
            chain = %event.chain,
            kind = ?event.kind,
            confirmations = event.confirmations,
            "Vote: event confirmed"
        );
        Ok(())
    }

    async fn submit_gas_price(
        &self,
        chain: ChainId,
        price_wei: U256,
        block: u64,
    ) -> anyhow::Result<()> {
        info!(%chain, %price_wei, block, "Vote: gas price sample");
        Ok(())
    }
}
