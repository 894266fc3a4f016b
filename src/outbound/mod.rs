//! Outbound transaction execution: turning an authorization from the
//! internal chain into a signed, broadcast gateway call.

use async_trait::async_trait;
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain_id::ChainId;
use crate::ethereum::RpcError;

pub mod broadcaster;
pub mod builder;

/// Classification assigned by the internal chain; selects the gateway
/// function together with asset nativity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxClass {
    Gas,
    Funds,
    Payload,
    FundsAndPayload,
    GasAndPayload,
    InboundRevert,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertInstructions {
    pub recipient: Address,
    pub message: Vec<u8>,
}

/// An outbound authorization as delivered by the internal chain.
#[derive(Debug, Clone)]
pub struct OutboundTxData {
    /// 32 bytes, right-padded if shorter.
    pub tx_id: Vec<u8>,
    /// 32 bytes, right-padded if shorter.
    pub universal_tx_id: Vec<u8>,
    pub destination_chain: ChainId,
    /// Originating caller on the source chain.
    pub sender: Address,
    pub recipient: Address,
    /// Zero address means the chain's native asset.
    pub asset_addr: Address,
    /// Decimal string, uint256 range.
    pub amount: String,
    pub payload: Vec<u8>,
    pub revert: RevertInstructions,
    pub class: TxClass,
    /// Decimal string; empty or "0" falls back to 500 000.
    pub gas_limit: String,
}

impl OutboundTxData {
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.asset_addr == Address::zero()
    }
}

#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    #[error("invalid gas limit {0:?}")]
    InvalidGasLimit(String),

    #[error("tx class {0:?} has no gateway function")]
    UnsupportedClass(TxClass),

    #[error("signature is not 64 bytes of r||s")]
    InvalidSignature,

    /// None of the four recovery ids reproduces the committee's address;
    /// the transaction must not be broadcast.
    #[error("no recovery id reproduces the expected signer")]
    RecoveryIdNotFound,

    #[error("signing oracle failed: {0}")]
    Signing(String),

    #[error("simulation reverted: {0}")]
    SimulationReverted(String),

    #[error("broadcast of {tx_hash:#x} failed: {source}")]
    Broadcast {
        tx_hash: H256,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Produces a raw 64-byte `r||s` signature for a signing hash. Backed by
/// the threshold-signature committee; recovery-id search stays with the
/// builder.
#[async_trait]
pub trait SigningOracle: Send + Sync {
    async fn sign(&self, signing_hash: H256) -> anyhow::Result<[u8; 64]>;
}

/// Gateway calls the executor can emit. Signatures are part of the
/// deployed contract ABI; the selector is `keccak256(signature)[..4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFunction {
    Withdraw,
    WithdrawTokens,
    ExecuteUniversalTxNative,
    ExecuteUniversalTxToken,
    RevertUniversalTx,
    RevertUniversalTxToken,
}

impl GatewayFunction {
    #[must_use]
    pub const fn signature(&self) -> &'static str {
        match self {
            Self::Withdraw => "withdraw(bytes32,bytes32,address,address,uint256)",
            Self::WithdrawTokens => "withdrawTokens(bytes32,bytes32,address,address,address,uint256)",
            Self::ExecuteUniversalTxNative => {
                "executeUniversalTx(bytes32,bytes32,address,address,uint256,bytes)"
            }
            Self::ExecuteUniversalTxToken => {
                "executeUniversalTx(bytes32,bytes32,address,address,address,uint256,bytes)"
            }
            Self::RevertUniversalTx => "revertUniversalTx(bytes32,bytes32,uint256,(address,bytes))",
            Self::RevertUniversalTxToken => {
                "revertUniversalTxToken(bytes32,bytes32,address,uint256,(address,bytes))"
            }
        }
    }

    #[must_use]
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }
}

/// Function table: class and asset nativity fully determine the call.
/// `GAS`-class transactions carry no gateway call and are rejected here.
pub fn gateway_function(class: TxClass, native: bool) -> Result<GatewayFunction, TxError> {
    match (class, native) {
        (TxClass::Funds, true) => Ok(GatewayFunction::Withdraw),
        (TxClass::Funds, false) => Ok(GatewayFunction::WithdrawTokens),
        (TxClass::Payload | TxClass::FundsAndPayload, true) => {
            Ok(GatewayFunction::ExecuteUniversalTxNative)
        }
        (TxClass::Payload | TxClass::FundsAndPayload, false) => {
            Ok(GatewayFunction::ExecuteUniversalTxToken)
        }
        (TxClass::InboundRevert, true) => Ok(GatewayFunction::RevertUniversalTx),
        (TxClass::InboundRevert, false) => Ok(GatewayFunction::RevertUniversalTxToken),
        (TxClass::Gas | TxClass::GasAndPayload, _) => Err(TxError::UnsupportedClass(class)),
    }
}
