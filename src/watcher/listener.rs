//! Forward-scans a chain for gateway logs and hands them to the store.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Filter, ValueOrArray, H256, U64};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{debug, info, instrument, warn};

use crate::chain_id::ChainId;
use crate::config::ChainConfig;
use crate::database::ChainStore;
use crate::ethereum::ChainRpc;
use crate::event::parser::EventParser;

/// One `eth_getLogs` call covers at most this many blocks, staying under
/// the 10 000-block limit most providers enforce.
const CHUNK_SIZE: u64 = 9000;

static EVENTS_OBSERVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "listener_events_total",
        "Events observed by the listener, by novelty.",
        &["chain", "outcome"]
    )
    .unwrap()
});

pub struct EventListener<R, S> {
    chain: ChainId,
    gateway: Address,
    topics: Vec<H256>,
    rpc: Arc<R>,
    store: Arc<S>,
    parser: EventParser,
    polling_interval: Duration,
    event_start_from: Option<i64>,
    cursor: Option<u64>,
}

impl<R, S> Clone for EventListener<R, S> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain,
            gateway: self.gateway,
            topics: self.topics.clone(),
            rpc: self.rpc.clone(),
            store: self.store.clone(),
            parser: self.parser.clone(),
            polling_interval: self.polling_interval,
            event_start_from: self.event_start_from,
            cursor: self.cursor,
        }
    }
}

impl<R, S> EventListener<R, S>
where
    R: ChainRpc,
    S: ChainStore,
{
    pub fn new(config: &ChainConfig, rpc: Arc<R>, store: Arc<S>) -> Self {
        Self {
            chain: config.id,
            gateway: config.gateway,
            topics: config.event_topics(),
            rpc,
            store,
            parser: EventParser::new(config.id, config),
            polling_interval: config.specific.event_polling_interval,
            event_start_from: config.specific.event_start_from,
            cursor: None,
        }
    }

    #[instrument(name = "EventListener::run", skip_all, fields(chain = %self.chain))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // A failed iteration leaves the cursor untouched so the whole
            // range is retried next tick.
            self.scan_once().await?;
        }
    }

    /// Starting point for the scan:
    /// 1. the stored chain height, when one exists;
    /// 2. otherwise the configured absolute start block;
    /// 3. otherwise (or when configured as -1) the current head.
    async fn resolve_cursor(&self) -> anyhow::Result<u64> {
        let stored = self.store.get_chain_height(self.chain).await?;
        if stored > 0 {
            debug!(chain = %self.chain, stored, "Resuming scan from stored height");
            return Ok(stored);
        }
        if let Some(start) = self.event_start_from {
            if start >= 0 {
                return Ok(start as u64);
            }
        }
        let head = self.rpc.latest_block().await?;
        info!(chain = %self.chain, head, "Starting scan from current head");
        Ok(head)
    }

    pub(crate) async fn scan_once(&mut self) -> anyhow::Result<()> {
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let cursor = self.resolve_cursor().await?;
                self.cursor = Some(cursor);
                cursor
            }
        };

        let latest = self.rpc.latest_block().await?;
        if cursor >= latest {
            return Ok(());
        }

        for (from, to) in chunk_ranges(cursor, latest, CHUNK_SIZE) {
            self.scan_range(from, to).await?;
        }

        self.store.update_chain_height(self.chain, latest).await?;
        self.cursor = Some(latest + 1);
        Ok(())
    }

    async fn scan_range(&self, from: u64, to: u64) -> anyhow::Result<()> {
        let mut filter = Filter::new()
            .address(self.gateway)
            .from_block(U64::from(from))
            .to_block(U64::from(to));
        filter.topics[0] = Some(ValueOrArray::Array(
            self.topics.iter().copied().map(Some).collect(),
        ));

        let logs = self.rpc.logs(&filter).await?;
        debug!(chain = %self.chain, from, to, logs = logs.len(), "Scanned block range");

        for log in logs {
            let event = match self.parser.parse(&log) {
                Ok(Some(event)) if event.has_payload() => event,
                Ok(Some(event)) => {
                    warn!(chain = %self.chain, event = %event.id, "Parsed event has no payload, skipping");
                    EVENTS_OBSERVED
                        .with_label_values(&[&self.chain.to_string(), "unparseable"])
                        .inc();
                    continue;
                }
                Ok(None) => continue,
                Err(error) => {
                    warn!(chain = %self.chain, %error, ?log, "Failed to parse gateway log, skipping");
                    EVENTS_OBSERVED
                        .with_label_values(&[&self.chain.to_string(), "unparseable"])
                        .inc();
                    continue;
                }
            };

            let outcome = self.store.insert_event_if_not_exists(&event).await?;
            if outcome.stored() {
                info!(
                    chain = %self.chain,
                    event = %event.id,
                    block = event.block_height,
                    kind = ?event.kind,
                    "Observed new gateway event"
                );
            } else {
                debug!(chain = %self.chain, event = %event.id, ?outcome, "Event already known");
            }
            let novelty = if outcome.stored() { "new" } else { "known" };
            EVENTS_OBSERVED
                .with_label_values(&[&self.chain.to_string(), novelty])
                .inc();
        }
        Ok(())
    }
}

/// Split `[from, to]` (inclusive) into ranges of at most `size` blocks.
fn chunk_ranges(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = to.min(start + size - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}
