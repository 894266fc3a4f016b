use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain_id::ChainId;

pub mod parser;
pub mod payload;

/// Primary key of an observed event: `<tx hash>:<log index>`, with the
/// hash in canonical lowercase `0x` hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventId(String);

#[derive(Debug, Error)]
pub enum EventIdError {
    #[error("event id {0:?} is not of the form <tx hash>:<log index>")]
    Malformed(String),
}

impl EventId {
    #[must_use]
    pub fn new(tx_hash: H256, log_index: u64) -> Self {
        Self(format!("{tx_hash:#x}:{log_index}"))
    }

    pub fn parse(s: &str) -> Result<Self, EventIdError> {
        let (hash, index) = s
            .split_once(':')
            .ok_or_else(|| EventIdError::Malformed(s.to_owned()))?;
        let hash: H256 = hash
            .parse()
            .map_err(|_| EventIdError::Malformed(s.to_owned()))?;
        let index: u64 = index
            .parse()
            .map_err(|_| EventIdError::Malformed(s.to_owned()))?;
        Ok(Self::new(hash, index))
    }

    /// Transaction hash portion, used by the confirmer to re-check the
    /// receipt.
    pub fn tx_hash(&self) -> Result<H256, EventIdError> {
        let (hash, _) = self
            .0
            .split_once(':')
            .ok_or_else(|| EventIdError::Malformed(self.0.clone()))?;
        hash.parse()
            .map_err(|_| EventIdError::Malformed(self.0.clone()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Inbound,
    Outbound,
    GasPrice,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::GasPrice => "gas_price",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "gas_price" => Some(Self::GasPrice),
            _ => None,
        }
    }
}

/// Which of the chain's two confirmation thresholds applies to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationClass {
    Fast,
    Standard,
}

impl ConfirmationClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "standard" => Some(Self::Standard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    PendingConfirmation,
    FastConfirmed,
    StandardConfirmed,
    AwaitingVote,
    VoteSubmitted,
    Completed,
    Reorged,
    Failed,
}

impl EventStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingConfirmation => "pending_confirmation",
            Self::FastConfirmed => "fast_confirmed",
            Self::StandardConfirmed => "standard_confirmed",
            Self::AwaitingVote => "awaiting_vote",
            Self::VoteSubmitted => "vote_submitted",
            Self::Completed => "completed",
            Self::Reorged => "reorged",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_confirmation" => Some(Self::PendingConfirmation),
            "fast_confirmed" => Some(Self::FastConfirmed),
            "standard_confirmed" => Some(Self::StandardConfirmed),
            "awaiting_vote" => Some(Self::AwaitingVote),
            "vote_submitted" => Some(Self::VoteSubmitted),
            "completed" => Some(Self::Completed),
            "reorged" => Some(Self::Reorged),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition. Statuses
    /// only move forward; the one sanctioned regression is a reorg, and a
    /// reorged event may be revived to pending when it is observed again.
    #[must_use]
    pub fn may_transition(&self, to: Self) -> bool {
        use EventStatus::{
            AwaitingVote, Completed, Failed, FastConfirmed, PendingConfirmation, Reorged,
            StandardConfirmed, VoteSubmitted,
        };

        if *self == to {
            return true;
        }
        match self {
            PendingConfirmation => matches!(
                to,
                FastConfirmed | StandardConfirmed | Reorged | Failed
            ),
            FastConfirmed | StandardConfirmed => matches!(to, AwaitingVote | Reorged | Failed),
            AwaitingVote => matches!(to, VoteSubmitted | Reorged | Failed),
            VoteSubmitted => matches!(to, Completed),
            Reorged => matches!(to, PendingConfirmation),
            Completed | Failed => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("illegal status transition {from:?} -> {to:?} for event {id}")]
pub struct StatusRegression {
    pub id: EventId,
    pub from: EventStatus,
    pub to: EventStatus,
}

/// An observed gateway event, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub chain: ChainId,
    pub block_height: u64,
    pub kind: EventKind,
    pub status: EventStatus,
    pub class: ConfirmationClass,
    pub confirmations: u64,
    /// JSON-encoded payload; schema depends on `kind`.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub voted_at: Option<DateTime<Utc>>,
}

impl Event {
    #[must_use]
    pub fn new(
        id: EventId,
        chain: ChainId,
        block_height: u64,
        kind: EventKind,
        class: ConfirmationClass,
        payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            chain,
            block_height,
            kind,
            status: EventStatus::PendingConfirmation,
            class,
            confirmations: 0,
            payload,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            voted_at: None,
        }
    }

    /// A parser that produced an event without a usable payload is treated
    /// as a parse failure upstream; `{}` is the smallest valid payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.payload.len() > 2
    }

    /// Move to `to`, enforcing the status state machine. An attempted
    /// regression is an invariant violation: it fails loudly in debug
    /// builds and is surfaced as an error in release builds.
    pub fn transition(&mut self, to: EventStatus) -> Result<(), StatusRegression> {
        if !self.status.may_transition(to) {
            debug_assert!(
                false,
                "illegal status transition {:?} -> {:?} for event {}",
                self.status, to, self.id
            );
            return Err(StatusRegression {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        match to {
            EventStatus::FastConfirmed | EventStatus::StandardConfirmed => {
                self.confirmed_at = Some(self.updated_at);
            }
            EventStatus::VoteSubmitted => {
                self.voted_at = Some(self.updated_at);
            }
            _ => {}
        }
        Ok(())
    }
}
