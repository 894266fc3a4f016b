//! Decodes raw gateway logs into typed [`Event`]s.
//!
//! Topic 0 selects the decoder through the configured method registry.
//! Decoding is deliberately lenient on short data: absent fields come out
//! as defaults, and only structurally unusable logs are rejected.

use std::collections::HashMap;

use ethers::types::{Address, Log, H256, U256};
use hex_literal::hex;
use thiserror::Error;
use tracing::debug;

use crate::chain_id::ChainId;
use crate::config::ChainConfig;
use crate::event::payload::{OutboundObservation, TxWithFunds, UniversalPayload};
use crate::event::{ConfirmationClass, Event, EventId, EventKind};

/// `add_funds` logs are filtered unconditionally; the gateway emits them
/// for internal accounting only.
pub const ADD_FUNDS_TOPIC: H256 = H256(hex!(
    "b28f49668e7e76dc96d7aabe5b7f63fecfbd1c3574774c05e8204e749fd96fbd"
));

pub const SEND_FUNDS_TOPIC: H256 = H256(hex!(
    "313800e2e529b7d45906548dd908bb537772d390b660787b2a929ddf1facf6e4"
));

pub const SEND_TX_WITH_GAS_TOPIC: H256 = H256(hex!(
    "fc9b0ad90b92705792c6281e89beaf1d977aa0d66afccefba2f5b207787c9aab"
));

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("log is missing {0}")]
    MissingField(&'static str),

    #[error("expected {expected} topics, found {actual}")]
    TopicCount { expected: usize, actual: usize },

    #[error("failed to encode event payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct Route {
    name: String,
}

/// Turns raw logs from one gateway into typed events.
#[derive(Debug, Clone)]
pub struct EventParser {
    chain: ChainId,
    gateway: Address,
    routes: HashMap<H256, Route>,
}

impl EventParser {
    #[must_use]
    pub fn new(chain: ChainId, config: &ChainConfig) -> Self {
        let routes = config
            .methods
            .iter()
            .map(|m| {
                (
                    m.event_topic,
                    Route {
                        name: m.name.clone(),
                    },
                )
            })
            .collect();
        Self {
            chain,
            gateway: config.gateway,
            routes,
        }
    }

    /// Decode one log. `Ok(None)` means the log is not ours (unknown
    /// topic, filtered topic, foreign contract); `Err` means the topic was
    /// recognized but the log is unusable.
    pub fn parse(&self, log: &Log) -> Result<Option<Event>, ParseError> {
        if log.address != self.gateway {
            return Ok(None);
        }
        let Some(&topic0) = log.topics.first() else {
            return Ok(None);
        };
        if topic0 == ADD_FUNDS_TOPIC {
            debug!(chain = %self.chain, "Skipping filtered add_funds log");
            return Ok(None);
        }
        let Some(route) = self.routes.get(&topic0) else {
            return Ok(None);
        };

        let tx_hash = log
            .transaction_hash
            .ok_or(ParseError::MissingField("transactionHash"))?;
        let log_index = log
            .log_index
            .ok_or(ParseError::MissingField("logIndex"))?
            .as_u64();
        let block_height = log
            .block_number
            .ok_or(ParseError::MissingField("blockNumber"))?
            .as_u64();
        if block_height == 0 {
            return Err(ParseError::MissingField("blockNumber"));
        }
        let id = EventId::new(tx_hash, log_index);

        let (kind, class, payload) = match route.name.as_str() {
            "sendFunds" => self.parse_send_funds(log, log_index)?,
            "sendTxWithGas" => self.parse_send_tx_with_gas(log, log_index)?,
            "outboundObservation" => parse_outbound_observation(log)?,
            other => {
                debug!(chain = %self.chain, method = other, "No decoder for configured method");
                return Ok(None);
            }
        };

        Ok(Some(Event::new(
            id,
            self.chain,
            block_height,
            kind,
            class,
            payload,
        )))
    }

    /// `sendFunds(sender idx, recipient idx, bridgeToken, bridgeAmount,
    /// payload off, revertCFG off, txType[, signatureData off])`.
    fn parse_send_funds(
        &self,
        log: &Log,
        log_index: u64,
    ) -> Result<(EventKind, ConfirmationClass, Vec<u8>), ParseError> {
        let data = log.data.as_ref();

        let sender = topic_address(log, 1);
        let recipient = topic_address(log, 2);
        let bridge_token = address_word(data, 0);
        let bridge_amount = u256_word(data, 1);
        let payload_offset = usize_word(data, 2);
        let revert_offset = usize_word(data, 3);
        let tx_type = u256_word(data, 4).low_u32() as u8;

        // The first dynamic offset doubles as the head size: a six-word
        // head means the event carries the optional signatureData field.
        let has_signature_data = payload_offset.is_some_and(|off| off >= 6 * 32);
        let signature_data = if has_signature_data {
            usize_word(data, 5)
                .map(|off| dyn_bytes(data, off))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let payload_bytes = payload_offset
            .map(|off| dyn_bytes(data, off))
            .unwrap_or_default();

        // The revert tuple is `(address fundRecipient, bytes message)`,
        // with the message offset relative to the tuple base.
        let (revert_fund_recipient, revert_msg) = match revert_offset {
            Some(base) => {
                let recipient = address_at(data, base);
                let rel = usize_at(data, base + 32);
                let msg = rel
                    .map(|rel| dyn_bytes(data, base + rel))
                    .unwrap_or_default();
                (recipient, msg)
            }
            None => (Address::zero(), Vec::new()),
        };

        let mut verification_data = if signature_data.is_empty() {
            String::new()
        } else {
            format!("0x{}", hex::encode(&signature_data))
        };

        let universal_payload = if payload_bytes.is_empty() {
            None
        } else {
            match UniversalPayload::decode(&payload_bytes) {
                Ok(up) => Some(up),
                Err(error) => {
                    debug!(chain = %self.chain, ?error, "Universal payload undecodable, keeping raw bytes");
                    verification_data = format!("0x{}", hex::encode(&payload_bytes));
                    None
                }
            }
        };

        let payload = TxWithFunds {
            source_chain: self.chain.to_string(),
            sender: format!("{sender:#x}"),
            recipient: format!("{recipient:#x}"),
            bridge_token: format!("{bridge_token:#x}"),
            bridge_amount: bridge_amount.to_string(),
            tx_type,
            log_index,
            universal_payload,
            revert_fund_recipient: format!("{revert_fund_recipient:#x}"),
            revert_msg: format!("0x{}", hex::encode(&revert_msg)),
            verification_data,
        };

        Ok((
            EventKind::Inbound,
            class_for_tx_type(tx_type),
            serde_json::to_vec(&payload)?,
        ))
    }

    /// `sendTxWithGas(sender idx, recipient, bridgeToken, bridgeAmount,
    /// txType, payload)`. The recipient and token travel behind struct
    /// pointers; the recipient address sits two words into its struct.
    fn parse_send_tx_with_gas(
        &self,
        log: &Log,
        log_index: u64,
    ) -> Result<(EventKind, ConfirmationClass, Vec<u8>), ParseError> {
        let data = log.data.as_ref();

        let sender = topic_address(log, 1);
        let recipient = usize_word(data, 0)
            .map(|off| address_word(data, off / 32 + 2))
            .unwrap_or_default();
        let bridge_amount = u256_word(data, 1);
        let bridge_token = usize_word(data, 2)
            .map(|off| address_word(data, off / 32))
            .unwrap_or_default();
        let tx_type = u256_word(data, 3).low_u32() as u8;
        let payload_bytes = usize_word(data, 4)
            .map(|off| dyn_bytes(data, off))
            .unwrap_or_default();

        let mut verification_data = String::new();
        let universal_payload = if payload_bytes.is_empty() {
            None
        } else {
            match UniversalPayload::decode(&payload_bytes) {
                Ok(up) => Some(up),
                Err(_) => {
                    verification_data = format!("0x{}", hex::encode(&payload_bytes));
                    None
                }
            }
        };

        let payload = TxWithFunds {
            source_chain: self.chain.to_string(),
            sender: format!("{sender:#x}"),
            recipient: format!("{recipient:#x}"),
            bridge_token: format!("{bridge_token:#x}"),
            bridge_amount: bridge_amount.to_string(),
            tx_type,
            log_index,
            universal_payload,
            revert_fund_recipient: format!("{:#x}", Address::zero()),
            revert_msg: "0x".to_owned(),
            verification_data,
        };

        Ok((
            EventKind::Inbound,
            class_for_tx_type(tx_type),
            serde_json::to_vec(&payload)?,
        ))
    }
}

/// `outboundObservation(txId idx, universalTxId idx)` carries everything
/// in its topics.
fn parse_outbound_observation(
    log: &Log,
) -> Result<(EventKind, ConfirmationClass, Vec<u8>), ParseError> {
    if log.topics.len() != 3 {
        return Err(ParseError::TopicCount {
            expected: 3,
            actual: log.topics.len(),
        });
    }
    let payload = OutboundObservation::new(log.topics[1], log.topics[2]);
    Ok((
        EventKind::Outbound,
        ConfirmationClass::Standard,
        serde_json::to_vec(&payload)?,
    ))
}

const fn class_for_tx_type(tx_type: u8) -> ConfirmationClass {
    if tx_type <= 1 {
        ConfirmationClass::Fast
    } else {
        ConfirmationClass::Standard
    }
}

fn topic_address(log: &Log, index: usize) -> Address {
    log.topics
        .get(index)
        .map(|t| Address::from_slice(&t.as_bytes()[12..]))
        .unwrap_or_default()
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
}

fn u256_word(data: &[u8], index: usize) -> U256 {
    word(data, index).map_or_else(U256::zero, U256::from_big_endian)
}

fn address_word(data: &[u8], index: usize) -> Address {
    word(data, index).map_or_else(Address::zero, |w| Address::from_slice(&w[12..]))
}

fn address_at(data: &[u8], offset: usize) -> Address {
    data.get(offset..offset + 32)
        .map_or_else(Address::zero, |w| Address::from_slice(&w[12..]))
}

fn usize_at(data: &[u8], offset: usize) -> Option<usize> {
    let word = data.get(offset..offset + 32)?;
    let value = U256::from_big_endian(word);
    // Offsets past 4 GiB cannot be genuine; treat them as absent.
    if value > U256::from(u32::MAX) {
        return None;
    }
    Some(value.as_usize())
}

fn usize_word(data: &[u8], index: usize) -> Option<usize> {
    usize_at(data, index * 32)
}

/// Length-prefixed `bytes` at an absolute offset. Reads are clamped to
/// the available data so short logs never panic.
fn dyn_bytes(data: &[u8], offset: usize) -> Vec<u8> {
    let Some(len) = usize_at(data, offset) else {
        return Vec::new();
    };
    let start = offset + 32;
    let end = start.saturating_add(len).min(data.len());
    data.get(start..end).map_or_else(Vec::new, <[u8]>::to_vec)
}
