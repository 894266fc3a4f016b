//! Tracks confirmations for pending events, detects reorgs, and emits
//! votes once a per-class threshold is reached.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{debug, error, info, instrument, warn};

use crate::chain_id::ChainId;
use crate::config::{BlockConfirmation, ChainConfig};
use crate::database::ChainStore;
use crate::ethereum::{ChainRpc, RpcError};
use crate::event::{ConfirmationClass, Event, EventStatus};
use crate::vote::VoteHandler;

static EVENT_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "confirmer_event_outcomes_total",
        "Terminal confirmer outcomes per chain.",
        &["chain", "outcome"]
    )
    .unwrap()
});

pub struct Confirmer<R, S> {
    chain: ChainId,
    thresholds: BlockConfirmation,
    polling_interval: Duration,
    rpc: Arc<R>,
    store: Arc<S>,
    votes: Arc<dyn VoteHandler>,
}

impl<R, S> Clone for Confirmer<R, S> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain,
            thresholds: self.thresholds,
            polling_interval: self.polling_interval,
            rpc: self.rpc.clone(),
            store: self.store.clone(),
            votes: self.votes.clone(),
        }
    }
}

impl<R, S> Confirmer<R, S>
where
    R: ChainRpc,
    S: ChainStore,
{
    pub fn new(
        config: &ChainConfig,
        rpc: Arc<R>,
        store: Arc<S>,
        votes: Arc<dyn VoteHandler>,
    ) -> Self {
        Self {
            chain: config.id,
            thresholds: config.block_confirmation,
            polling_interval: config.specific.event_polling_interval,
            rpc,
            store,
            votes,
        }
    }

    #[instrument(name = "Confirmer::run", skip_all, fields(chain = %self.chain))]
    pub async fn run(self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    pub(crate) async fn tick(&self) -> anyhow::Result<()> {
        let latest = self.rpc.latest_block().await?;
        let pending = self
            .store
            .list_by_status(
                self.chain,
                &[EventStatus::PendingConfirmation, EventStatus::AwaitingVote],
            )
            .await?;

        for mut event in pending {
            // A vote that was cut short by a restart is resubmitted; the
            // receiver is idempotent.
            if event.status == EventStatus::AwaitingVote {
                self.submit_vote(&mut event).await?;
                continue;
            }
            self.track(&mut event, latest).await?;
        }
        Ok(())
    }

    async fn track(&self, event: &mut Event, latest: u64) -> anyhow::Result<()> {
        let tx_hash = match event.id.tx_hash() {
            Ok(hash) => hash,
            Err(error) => {
                error!(chain = %self.chain, event = %event.id, %error, "Unparseable event id, skipping");
                return Ok(());
            }
        };

        let receipt = match self.rpc.transaction_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(RpcError::NotFound) => {
                // The transaction fell out of the canonical chain. Flip
                // the event; a later observation revives it.
                warn!(
                    chain = %self.chain,
                    event = %event.id,
                    block = event.block_height,
                    "Receipt gone, marking event reorged"
                );
                self.apply_transition(event, EventStatus::Reorged, 0).await?;
                EVENT_OUTCOMES
                    .with_label_values(&[&self.chain.to_string(), "reorged"])
                    .inc();
                return Ok(());
            }
            Err(error) => {
                warn!(chain = %self.chain, event = %event.id, operation = "eth_getTransactionReceipt", %error, "Receipt check failed, retrying next tick");
                return Ok(());
            }
        };

        if receipt.status == Some(0.into()) {
            warn!(chain = %self.chain, event = %event.id, "Transaction reverted on-chain");
            let confirmations = event.confirmations;
            self.apply_transition(event, EventStatus::Failed, confirmations)
                .await?;
            EVENT_OUTCOMES
                .with_label_values(&[&self.chain.to_string(), "failed"])
                .inc();
            return Ok(());
        }

        let Some(receipt_block) = receipt.block_number.map(|b| b.as_u64()) else {
            // Receipt without a block: still in flight, check again later.
            return Ok(());
        };

        if receipt_block != event.block_height {
            info!(
                chain = %self.chain,
                event = %event.id,
                stored = event.block_height,
                observed = receipt_block,
                "Transaction moved to a different block"
            );
            event.block_height = receipt_block;
            event.confirmations = 0;
            event.updated_at = chrono::Utc::now();
            self.store.update_event(event).await?;
            return Ok(());
        }

        let confirmations = if latest >= event.block_height {
            latest - event.block_height + 1
        } else {
            0
        };
        event.confirmations = confirmations;

        let required = self.thresholds.required(event.class);
        if confirmations >= required {
            let confirmed = match event.class {
                ConfirmationClass::Fast => EventStatus::FastConfirmed,
                ConfirmationClass::Standard => EventStatus::StandardConfirmed,
            };
            if self.transition(event, confirmed).is_err() {
                return Ok(());
            }
            if self.transition(event, EventStatus::AwaitingVote).is_err() {
                return Ok(());
            }
            self.store.update_event(event).await?;
            self.submit_vote(event).await?;
        } else {
            debug!(
                chain = %self.chain,
                event = %event.id,
                confirmations,
                required,
                "Event below threshold"
            );
            event.updated_at = chrono::Utc::now();
            self.store.update_event(event).await?;
        }
        Ok(())
    }

    async fn submit_vote(&self, event: &mut Event) -> anyhow::Result<()> {
        match self.votes.submit_event(event).await {
            Ok(()) => {
                // One acknowledgement advances both steps; persisting the
                // intermediate status keeps a crash resubmittable.
                if self.transition(event, EventStatus::VoteSubmitted).is_ok() {
                    self.store.update_event(event).await?;
                }
                if self.transition(event, EventStatus::Completed).is_ok() {
                    self.store.update_event(event).await?;
                }
                info!(chain = %self.chain, event = %event.id, "Event vote acknowledged");
                EVENT_OUTCOMES
                    .with_label_values(&[&self.chain.to_string(), "completed"])
                    .inc();
            }
            Err(error) => {
                warn!(
                    chain = %self.chain,
                    event = %event.id,
                    operation = "submit_event",
                    %error,
                    "Vote submission failed, will retry"
                );
            }
        }
        Ok(())
    }

    async fn apply_transition(
        &self,
        event: &mut Event,
        to: EventStatus,
        confirmations: u64,
    ) -> anyhow::Result<()> {
        if self.transition(event, to).is_ok() {
            event.confirmations = confirmations;
            self.store.update_event(event).await?;
        }
        Ok(())
    }

    fn transition(&self, event: &mut Event, to: EventStatus) -> Result<(), ()> {
        match event.transition(to) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!(chain = %self.chain, %error, "Refusing status regression");
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{
        Address, Bytes, Filter, Log, TransactionReceipt, H256, U256, U64,
    };
    use similar_asserts::assert_eq;

    use crate::config::{ChainSpecificConfig, GatewayMethod, VmKind};
    use crate::database::memory::MemoryStore;
    use crate::event::parser::SEND_FUNDS_TOPIC;
    use crate::event::{EventId, EventKind};

    use super::*;

    #[derive(Clone)]
    enum ReceiptBehavior {
        NotFound,
        Error,
        Mined { block: u64, status: u64 },
    }

    struct MockRpc {
        latest: AtomicU64,
        receipts: StdMutex<HashMap<H256, ReceiptBehavior>>,
    }

    impl MockRpc {
        fn new(latest: u64) -> Self {
            Self {
                latest: AtomicU64::new(latest),
                receipts: StdMutex::new(HashMap::new()),
            }
        }

        fn set_receipt(&self, hash: H256, behavior: ReceiptBehavior) {
            self.receipts.lock().unwrap().insert(hash, behavior);
        }

        fn set_latest(&self, latest: u64) {
            self.latest.store(latest, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn latest_block(&self) -> Result<u64, RpcError> {
            Ok(self.latest.load(Ordering::SeqCst))
        }

        async fn logs(&self, _filter: &Filter) -> Result<Vec<Log>, RpcError> {
            Ok(Vec::new())
        }

        async fn transaction_receipt(&self, hash: H256) -> Result<TransactionReceipt, RpcError> {
            let behavior = self
                .receipts
                .lock()
                .unwrap()
                .get(&hash)
                .cloned()
                .unwrap_or(ReceiptBehavior::NotFound);
            match behavior {
                ReceiptBehavior::NotFound => Err(RpcError::NotFound),
                ReceiptBehavior::Error => Err(RpcError::Transport("flaky".into())),
                ReceiptBehavior::Mined { block, status } => Ok(TransactionReceipt {
                    transaction_hash: hash,
                    block_number: Some(U64::from(block)),
                    status: Some(U64::from(status)),
                    ..TransactionReceipt::default()
                }),
            }
        }

        async fn gas_price(&self) -> Result<U256, RpcError> {
            Ok(U256::zero())
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
    struct CountingVotes {
        submitted: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl VoteHandler for CountingVotes {
        async fn submit_event(&self, _event: &Event) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("internal chain unavailable");
            }
            self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn submit_gas_price(
            &self,
            _chain: ChainId,
            _price_wei: U256,
            _block: u64,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config() -> ChainConfig {
        ChainConfig {
            id: ChainId::new(11_155_111),
            vm: VmKind::Evm,
            gateway: Address::repeat_byte(0x42),
            inbound_enabled: true,
            outbound_enabled: true,
            block_confirmation: BlockConfirmation {
                fast: 5,
                standard: 12,
            },
            methods: vec![GatewayMethod {
                name: "sendFunds".to_owned(),
                method_selector: "0x11223344".to_owned(),
                event_topic: SEND_FUNDS_TOPIC,
                confirmation_class: ConfirmationClass::Fast,
            }],
            specific: ChainSpecificConfig {
                rpc_urls: vec!["https://rpc.example.com".parse().unwrap()],
                event_polling_interval: Duration::from_secs(5),
                gas_price_polling_interval: Duration::from_secs(30),
                event_start_from: None,
            },
        }
    }

    struct Fixture {
        rpc: Arc<MockRpc>,
        store: Arc<MemoryStore>,
        votes: Arc<CountingVotes>,
        confirmer: Confirmer<MockRpc, MemoryStore>,
    }

    fn fixture(latest: u64) -> Fixture {
        let rpc = Arc::new(MockRpc::new(latest));
        let store = Arc::new(MemoryStore::new());
        let votes = Arc::new(CountingVotes::default());
        let confirmer = Confirmer::new(&config(), rpc.clone(), store.clone(), votes.clone());
        Fixture {
            rpc,
            store,
            votes,
            confirmer,
        }
    }

    async fn seed_event(
        fixture: &Fixture,
        hash: H256,
        block: u64,
        class: ConfirmationClass,
    ) -> EventId {
        let event = Event::new(
            EventId::new(hash, 0),
            ChainId::new(11_155_111),
            block,
            EventKind::Inbound,
            class,
            br#"{"k":1}"#.to_vec(),
        );
        fixture
            .store
            .insert_event_if_not_exists(&event)
            .await
            .unwrap();
        event.id
    }

    async fn status_of(fixture: &Fixture, id: &EventId) -> (EventStatus, u64, u64) {
        let event = fixture.store.get_event(id).await.unwrap().unwrap();
        (event.status, event.confirmations, event.block_height)
    }

    #[tokio::test]
    async fn fast_event_confirms_at_inclusive_threshold() {
        let fixture = fixture(1003);
        let hash = H256::repeat_byte(0xaa);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Mined {
            block: 1000,
            status: 1,
        });

        // head 1003 -> 4 confirmations, below fast=5
        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::PendingConfirmation);
        assert_eq!(confirmations, 4);
        assert_eq!(fixture.votes.submitted.load(Ordering::SeqCst), 0);

        // head 1004 -> 5 confirmations, meets the threshold inclusively
        fixture.rpc.set_latest(1004);
        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Completed);
        assert_eq!(confirmations, 5);
        assert_eq!(fixture.votes.submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn standard_event_waits_for_higher_threshold() {
        let fixture = fixture(1005);
        let hash = H256::repeat_byte(0xbb);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Standard).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Mined {
            block: 1000,
            status: 1,
        });

        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::PendingConfirmation);
        assert_eq!(confirmations, 6);

        fixture.rpc.set_latest(1011);
        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Completed);
        assert_eq!(confirmations, 12);
    }

    #[tokio::test]
    async fn missing_receipt_marks_reorged() {
        let fixture = fixture(1010);
        let hash = H256::repeat_byte(0xcc);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        // No receipt registered -> NotFound.

        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Reorged);
        assert_eq!(confirmations, 0);
        assert_eq!(fixture.votes.submitted.load(Ordering::SeqCst), 0);

        // Observed again at a later block: back to pending.
        let mut revived = fixture.store.get_event(&id).await.unwrap().unwrap();
        revived.block_height = 1002;
        let outcome = fixture
            .store
            .insert_event_if_not_exists(&revived)
            .await
            .unwrap();
        assert_eq!(outcome, crate::database::InsertOutcome::Revived);
        let (status, confirmations, block) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::PendingConfirmation);
        assert_eq!(confirmations, 0);
        assert_eq!(block, 1002);
    }

    #[tokio::test]
    async fn rpc_error_leaves_event_untouched() {
        let fixture = fixture(1010);
        let hash = H256::repeat_byte(0xdd);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Error);

        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::PendingConfirmation);
        assert_eq!(confirmations, 0);
    }

    #[tokio::test]
    async fn reverted_receipt_fails_event() {
        let fixture = fixture(1010);
        let hash = H256::repeat_byte(0xee);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Mined {
            block: 1000,
            status: 0,
        });

        fixture.confirmer.tick().await.unwrap();
        let (status, _, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Failed);
        assert_eq!(fixture.votes.submitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn moved_receipt_resets_block_and_confirmations() {
        let fixture = fixture(1010);
        let hash = H256::repeat_byte(0xab);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Mined {
            block: 1003,
            status: 1,
        });

        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, block) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::PendingConfirmation);
        assert_eq!(confirmations, 0);
        assert_eq!(block, 1003);

        // Next tick, tracking continues from the new block.
        fixture.confirmer.tick().await.unwrap();
        let (status, confirmations, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Completed);
        assert_eq!(confirmations, 8);
    }

    #[tokio::test]
    async fn failed_vote_is_retried_from_awaiting_vote() {
        let fixture = fixture(1010);
        let hash = H256::repeat_byte(0xcd);
        let id = seed_event(&fixture, hash, 1000, ConfirmationClass::Fast).await;
        fixture.rpc.set_receipt(hash, ReceiptBehavior::Mined {
            block: 1000,
            status: 1,
        });
        fixture.votes.fail.store(true, Ordering::SeqCst);

        fixture.confirmer.tick().await.unwrap();
        let (status, _, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::AwaitingVote);

        // The internal chain comes back; the stored AwaitingVote event is
        // picked up without re-deriving confirmations.
        fixture.votes.fail.store(false, Ordering::SeqCst);
        fixture.confirmer.tick().await.unwrap();
        let (status, _, _) = status_of(&fixture, &id).await;
        assert_eq!(status, EventStatus::Completed);
        assert_eq!(fixture.votes.submitted.load(Ordering::SeqCst), 1);
    }
}
