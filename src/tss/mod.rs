//! Threshold-signature session engine.
//!
//! Four session kinds share one surface: feed inbound protocol payloads,
//! step the native state, route the emitted messages, and extract either
//! a keyshare or a signature. The underlying MPC protocol is a black box
//! behind [`protocol::SessionBackend`]; this module owns queueing,
//! message routing, result verification and lifecycle.

use thiserror::Error;
use zeroize::Zeroizing;

pub mod driver;
pub mod protocol;
pub mod session;

pub use session::Session;

/// Bounded inbound payload queue per session.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Keygen,
    KeyRefresh,
    QuorumChange,
    Sign,
}

/// A protocol payload addressed to another participant. Routing is the
/// driver's job; the engine never talks to the network itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub receiver: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session setup must not be empty")]
    EmptySetup,

    #[error("party id must not be empty")]
    EmptyPartyId,

    #[error("participants list must not be empty")]
    NoParticipants,

    #[error("message hash must be 32 bytes")]
    InvalidMessageHash,

    #[error("keyshare must not be empty")]
    EmptyKeyshare,

    #[error("inbound payload queue is full")]
    PayloadBufferFull,

    #[error("session is closed")]
    Closed,

    #[error("session has not finished")]
    NotFinished,

    #[error("session result already extracted")]
    ResultTaken,

    #[error("produced signature does not verify against the session key")]
    SignatureVerificationFailed,

    #[error("session result does not preserve the expected public key")]
    PublicKeyMismatch,

    #[error("quorum change did not rotate the key id")]
    KeyIdNotRotated,

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Clone)]
pub enum SessionOutcome {
    /// Serialized participant-local secret produced by keygen, refresh or
    /// quorum change.
    Keyshare(Zeroizing<Vec<u8>>),
    /// 64-byte `r||s`, verified against the session key before release.
    Signature([u8; 64]),
}

impl std::fmt::Debug for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Keyshares are secrets; never print them.
            Self::Keyshare(share) => write!(f, "Keyshare({} bytes)", share.len()),
            Self::Signature(sig) => write!(f, "Signature(0x{})", hex::encode(sig)),
        }
    }
}

/// What a completed session hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub kind: SessionKind,
    pub session_id: String,
    pub participants: Vec<String>,
    /// Hex of the 32-byte key id extracted from the keyshare.
    pub key_id: String,
    /// Compressed secp256k1 public key.
    pub public_key: [u8; 33],
    pub outcome: SessionOutcome,
}

impl SessionResult {
    #[must_use]
    pub fn signature(&self) -> Option<&[u8; 64]> {
        match &self.outcome {
            SessionOutcome::Signature(sig) => Some(sig),
            SessionOutcome::Keyshare(_) => None,
        }
    }

    #[must_use]
    pub fn keyshare(&self) -> Option<&[u8]> {
        match &self.outcome {
            SessionOutcome::Keyshare(share) => Some(share.as_slice()),
            SessionOutcome::Signature(_) => None,
        }
    }
}
