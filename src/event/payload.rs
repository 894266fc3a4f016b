//! JSON payload schemas persisted with observed events.
//!
//! Key casing is part of the wire contract with the internal chain and
//! must not change.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Destination-call description carried inside a funds event, ABI-encoded
/// behind an offset word.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniversalPayload {
    pub to: String,
    pub value: String,
    pub data: String,
    pub gas_limit: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub nonce: String,
    pub deadline: String,
    pub v_type: u8,
}

impl UniversalPayload {
    /// The ABI tuple layout:
    /// `(address, uint256, bytes, uint256, uint256, uint256, uint256, uint256, uint8)`.
    fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(8),
        ])
    }

    /// Decode from the raw `bytes` field of a gateway event.
    pub fn decode(data: &[u8]) -> Result<Self, abi::Error> {
        let tokens = abi::decode(&[Self::param_type()], data)?;
        let Some(Token::Tuple(fields)) = tokens.into_iter().next() else {
            return Err(abi::Error::InvalidData);
        };
        let mut fields = fields.into_iter();

        let mut next = || fields.next().ok_or(abi::Error::InvalidData);

        let to = as_address(next()?)?;
        let value = as_uint(next()?)?;
        let data = as_bytes(next()?)?;
        let gas_limit = as_uint(next()?)?;
        let max_fee_per_gas = as_uint(next()?)?;
        let max_priority_fee_per_gas = as_uint(next()?)?;
        let nonce = as_uint(next()?)?;
        let deadline = as_uint(next()?)?;
        let v_type = as_uint(next()?)?;

        Ok(Self {
            to: format!("{to:#x}"),
            value: value.to_string(),
            data: format!("0x{}", hex::encode(data)),
            gas_limit: gas_limit.to_string(),
            max_fee_per_gas: max_fee_per_gas.to_string(),
            max_priority_fee_per_gas: max_priority_fee_per_gas.to_string(),
            nonce: nonce.to_string(),
            deadline: deadline.to_string(),
            v_type: v_type.low_u32() as u8,
        })
    }
}

fn as_address(token: Token) -> Result<Address, abi::Error> {
    match token {
        Token::Address(a) => Ok(a),
        _ => Err(abi::Error::InvalidData),
    }
}

fn as_uint(token: Token) -> Result<U256, abi::Error> {
    match token {
        Token::Uint(v) => Ok(v),
        _ => Err(abi::Error::InvalidData),
    }
}

fn as_bytes(token: Token) -> Result<Vec<u8>, abi::Error> {
    match token {
        Token::Bytes(b) => Ok(b),
        _ => Err(abi::Error::InvalidData),
    }
}

/// Payload persisted for `sendFunds` / `sendTxWithGas` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxWithFunds {
    pub source_chain: String,
    pub sender: String,
    pub recipient: String,
    pub bridge_token: String,
    pub bridge_amount: String,
    pub tx_type: u8,
    pub log_index: u64,
    pub universal_payload: Option<UniversalPayload>,
    pub revert_fund_recipient: String,
    pub revert_msg: String,
    pub verification_data: String,
}

/// Payload persisted for `outboundObservation` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundObservation {
    pub tx_id: String,
    pub universal_tx_id: String,
}

impl OutboundObservation {
    #[must_use]
    pub fn new(tx_id: H256, universal_tx_id: H256) -> Self {
        Self {
            tx_id: format!("{tx_id:#x}"),
            universal_tx_id: format!("{universal_tx_id:#x}"),
        }
    }
}
