//! Nonce sourcing, idempotent broadcast, and on-chain verification of
//! outbound transactions.

use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{info, instrument, warn};

use crate::chain_id::ChainId;
use crate::ethereum::{ChainRpc, RpcError};

use super::builder::TxBuilder;
use super::{OutboundTxData, SigningOracle, TxError};

static BROADCASTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "outbound_broadcasts_total",
        "Outbound transaction broadcasts by outcome.",
        &["chain", "outcome"]
    )
    .unwrap()
});

/// Receipt-level verdict for a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxVerification {
    pub found: bool,
    pub confirmations: u64,
    pub succeeded: bool,
}

pub struct Broadcaster<R> {
    chain: ChainId,
    rpc: Arc<R>,
}

impl<R: ChainRpc> Broadcaster<R> {
    pub fn new(chain: ChainId, rpc: Arc<R>) -> Self {
        Self { chain, rpc }
    }

    /// Next nonce for `signer`. The pending count is the normal path;
    /// `use_finalized` switches to the latest-block count so a caller can
    /// rebuild a stuck transaction under its original nonce.
    pub async fn next_nonce(&self, signer: Address, use_finalized: bool) -> Result<U256, RpcError> {
        self.rpc.transaction_count(signer, !use_finalized).await
    }

    pub async fn suggest_gas_price(&self) -> Result<U256, RpcError> {
        self.rpc.gas_price().await
    }

    /// Dry-run the call; a revert surfaces with its payload before any
    /// signature is requested.
    pub async fn simulate(&self, tx: &TypedTransaction) -> Result<(), TxError> {
        match self.rpc.call(tx).await {
            Ok(_) => Ok(()),
            Err(RpcError::Transport(message)) if message.to_lowercase().contains("revert") => {
                Err(TxError::SimulationReverted(message))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Send the raw transaction. The hash is computed before the send so
    /// callers can correlate even when the RPC fails; an endpoint that
    /// already knows the transaction counts as success.
    #[instrument(skip_all, fields(chain = %self.chain))]
    pub async fn broadcast(&self, raw: Bytes) -> Result<H256, TxError> {
        let tx_hash = H256::from(keccak256(&raw));

        match self.rpc.send_raw_transaction(raw).await {
            Ok(_) => {
                info!(chain = %self.chain, tx = %format!("{tx_hash:#x}"), "Broadcast outbound transaction");
                BROADCASTS
                    .with_label_values(&[&self.chain.to_string(), "sent"])
                    .inc();
                Ok(tx_hash)
            }
            Err(error) if is_known_tx_error(&error) => {
                info!(chain = %self.chain, tx = %format!("{tx_hash:#x}"), %error, "Transaction already known, treating as broadcast");
                BROADCASTS
                    .with_label_values(&[&self.chain.to_string(), "already_known"])
                    .inc();
                Ok(tx_hash)
            }
            Err(source) => {
                warn!(chain = %self.chain, tx = %format!("{tx_hash:#x}"), %source, "Broadcast failed");
                BROADCASTS
                    .with_label_values(&[&self.chain.to_string(), "error"])
                    .inc();
                Err(TxError::Broadcast { tx_hash, source })
            }
        }
    }

    /// `(found, confirmations, status)` for a previously broadcast hash.
    pub async fn verify_broadcast(&self, hash: H256) -> Result<TxVerification, TxError> {
        let receipt = match self.rpc.transaction_receipt(hash).await {
            Ok(receipt) => receipt,
            Err(RpcError::NotFound) => {
                return Ok(TxVerification {
                    found: false,
                    confirmations: 0,
                    succeeded: false,
                })
            }
            Err(error) => return Err(error.into()),
        };

        let latest = self.rpc.latest_block().await?;
        let block = receipt.block_number.map_or(0, |b| b.as_u64());
        let confirmations = if block > 0 && latest >= block {
            latest - block + 1
        } else {
            0
        };

        Ok(TxVerification {
            found: true,
            confirmations,
            succeeded: receipt.status == Some(1.into()),
        })
    }
}

fn is_known_tx_error(error: &RpcError) -> bool {
    let RpcError::Transport(message) = error else {
        return false;
    };
    let message = message.to_lowercase();
    message.contains("already known")
        || message.contains("known transaction")
        || message.contains("already_exists")
        || message.contains("nonce too low")
}

/// End-to-end outbound path: nonce, build, optional simulation, committee
/// signature, recovery-id search, broadcast.
pub struct OutboundExecutor<R> {
    builder: TxBuilder,
    broadcaster: Broadcaster<R>,
    oracle: Arc<dyn SigningOracle>,
    /// The committee's external-chain address; assembled signatures must
    /// recover to it.
    signer: Address,
}

impl<R: ChainRpc> OutboundExecutor<R> {
    pub fn new(
        chain: ChainId,
        gateway: Address,
        rpc: Arc<R>,
        oracle: Arc<dyn SigningOracle>,
        signer: Address,
    ) -> Self {
        Self {
            builder: TxBuilder::new(chain, gateway),
            broadcaster: Broadcaster::new(chain, rpc),
            oracle,
            signer,
        }
    }

    #[must_use]
    pub const fn broadcaster(&self) -> &Broadcaster<R> {
        &self.broadcaster
    }

    #[instrument(skip_all, fields(chain = %data.destination_chain, class = ?data.class))]
    pub async fn execute(
        &self,
        data: &OutboundTxData,
        simulate: bool,
        use_finalized_nonce: bool,
    ) -> Result<H256, TxError> {
        let nonce = self
            .broadcaster
            .next_nonce(self.signer, use_finalized_nonce)
            .await?;
        let gas_price = self.broadcaster.suggest_gas_price().await?;

        let mut tx = self.builder.build_unsigned(data, nonce, gas_price)?;
        if let TypedTransaction::Legacy(ref mut inner) = tx {
            inner.from = Some(self.signer);
        }

        if simulate {
            self.broadcaster.simulate(&tx).await?;
        }

        let hash = TxBuilder::signing_hash(&tx);
        let raw_signature = self
            .oracle
            .sign(hash)
            .await
            .map_err(|e| TxError::Signing(e.to_string()))?;

        let encoded = self
            .builder
            .assemble_signature(&tx, &raw_signature, self.signer)?;
        self.broadcaster.broadcast(encoded).await
    }
}
