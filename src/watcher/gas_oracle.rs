//! Periodically samples the chain's suggested gas price and votes it into
//! the internal chain.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::chain_id::ChainId;
use crate::config::ChainConfig;
use crate::ethereum::ChainRpc;
use crate::vote::VoteHandler;

pub struct GasOracle<R> {
    chain: ChainId,
    polling_interval: Duration,
    rpc: Arc<R>,
    votes: Arc<dyn VoteHandler>,
}

impl<R> Clone for GasOracle<R> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain,
            polling_interval: self.polling_interval,
            rpc: self.rpc.clone(),
            votes: self.votes.clone(),
        }
    }
}

impl<R: ChainRpc> GasOracle<R> {
    pub fn new(config: &ChainConfig, rpc: Arc<R>, votes: Arc<dyn VoteHandler>) -> Self {
        Self {
            chain: config.id,
            polling_interval: config.specific.gas_price_polling_interval,
            rpc,
            votes,
        }
    }

    #[instrument(name = "GasOracle::run", skip_all, fields(chain = %self.chain))]
    pub async fn run(self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // A failed sample is dropped; the next tick takes a fresh one.
            if let Err(error) = self.poll_once().await {
                warn!(chain = %self.chain, operation = "gas_price_vote", %error, "Gas price sample failed, skipping");
            }
        }
    }

    pub(crate) async fn poll_once(&self) -> anyhow::Result<()> {
        let price = self.rpc.gas_price().await?;
        let block = self.rpc.latest_block().await?;
        self.votes.submit_gas_price(self.chain, price, block).await?;
        debug!(chain = %self.chain, %price, block, "Voted gas price");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Address, Bytes, Filter, Log, TransactionReceipt, H256, U256};

    use crate::config::{BlockConfirmation, ChainSpecificConfig, VmKind};
    use crate::ethereum::RpcError;
    use crate::event::Event;

    use super::*;

    struct MockRpc {
        fail_gas_price: AtomicBool,
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn latest_block(&self) -> Result<u64, RpcError> {
            Ok(4242)
        }

        async fn logs(&self, _filter: &Filter) -> Result<Vec<Log>, RpcError> {
            Ok(Vec::new())
        }

        async fn transaction_receipt(&self, _hash: H256) -> Result<TransactionReceipt, RpcError> {
            Err(RpcError::NotFound)
        }

        async fn gas_price(&self) -> Result<U256, RpcError> {
            if self.fail_gas_price.load(Ordering::SeqCst) {
                Err(RpcError::Transport("down".into()))
            } else {
                Ok(U256::from(31_000_000_000_u64))
            }
        }

        async fn transaction_count(
            &self,
            _address: Address,
            _pending: bool,
        ) -> Result<U256, RpcError> {
            Ok(U256::zero())
        }

        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<H256, RpcError> {
            Ok(H256::zero())
        }

        async fn call(&self, _tx: &TypedTransaction) -> Result<Bytes, RpcError> {
            Ok(Bytes::new())
        }
    }

    #[derive(Default)]
    struct RecordingVotes {
        samples: StdMutex<Vec<(ChainId, U256, u64)>>,
    }

    #[async_trait]
    impl VoteHandler for RecordingVotes {
        async fn submit_event(&self, _event: &Event) -> anyhow::Result<()> {
            Ok(())
        }

        async fn submit_gas_price(
            &self,
            chain: ChainId,
            price_wei: U256,
            block: u64,
        ) -> anyhow::Result<()> {
            self.samples.lock().unwrap().push((chain, price_wei, block));
            Ok(())
        }
    }

    fn config() -> ChainConfig {
        ChainConfig {
            id: ChainId::new(137),
            vm: VmKind::Evm,
            gateway: Address::repeat_byte(0x42),
            inbound_enabled: true,
            outbound_enabled: true,
            block_confirmation: BlockConfirmation {
                fast: 5,
                standard: 12,
            },
            methods: Vec::new(),
            specific: ChainSpecificConfig {
                rpc_urls: vec!["https://rpc.example.com".parse().unwrap()],
                event_polling_interval: Duration::from_secs(5),
                gas_price_polling_interval: Duration::from_secs(30),
                event_start_from: None,
            },
        }
    }

    #[tokio::test]
    async fn votes_price_and_block() {
        let rpc = Arc::new(MockRpc {
            fail_gas_price: AtomicBool::new(false),
        });
        let votes = Arc::new(RecordingVotes::default());
        let oracle = GasOracle::new(&config(), rpc, votes.clone());

        oracle.poll_once().await.unwrap();

        let samples = votes.samples.lock().unwrap();
        assert_eq!(
            *samples,
            vec![(
                ChainId::new(137),
                U256::from(31_000_000_000_u64),
                4242
            )]
        );
    }

    #[tokio::test]
    async fn failed_sample_is_an_error_not_a_vote() {
        let rpc = Arc::new(MockRpc {
            fail_gas_price: AtomicBool::new(true),
        });
        let votes = Arc::new(RecordingVotes::default());
        let oracle = GasOracle::new(&config(), rpc, votes.clone());

        assert!(oracle.poll_once().await.is_err());
        assert!(votes.samples.lock().unwrap().is_empty());
    }
}
