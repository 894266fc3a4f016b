//! Seam to the MPC session library. The engine treats protocol states as
//! opaque: payloads in, payloads out, one finalization at the end.

use super::SessionError;

/// What finalizing a native protocol state yields.
#[derive(Debug)]
pub enum ProtocolOutput {
    Keyshare {
        /// Opaque serialized keyshare.
        share: Vec<u8>,
        /// Compressed secp256k1 public key of the distributed key.
        public_key: [u8; 33],
        key_id: [u8; 32],
    },
    Signature([u8; 64]),
}

/// One party's live protocol state. Implementations wrap the native MPC
/// library handle; dropping the state releases it.
pub trait ProtocolState: Send {
    /// Feed one inbound payload. `Ok(true)` means the protocol finished.
    fn input_message(&mut self, payload: &[u8]) -> Result<bool, SessionError>;

    /// Drain one pending outbound payload, if any.
    fn output_message(&mut self) -> Result<Option<Vec<u8>>, SessionError>;

    /// Receiver party id at `index` for an outbound payload; `None`
    /// terminates the list.
    fn message_receiver(&self, payload: &[u8], index: usize)
        -> Result<Option<String>, SessionError>;

    /// Consume the state and produce the protocol output.
    fn finish(self: Box<Self>) -> Result<ProtocolOutput, SessionError>;
}

/// Constructs protocol states from setup blobs and inspects keyshares.
/// The setup blob is the single source of agreement between parties: two
/// sessions sharing an id but different setups cannot complete.
pub trait SessionBackend: Send + Sync + 'static {
    type State: ProtocolState;

    fn keygen(&self, setup: &[u8], party_id: &str) -> Result<Self::State, SessionError>;

    fn key_refresh(
        &self,
        setup: &[u8],
        party_id: &str,
        old_keyshare: &[u8],
    ) -> Result<Self::State, SessionError>;

    /// `old_keyshare` is `None` for parties joining the quorum. The state
    /// owns a copy; the caller frees its original unconditionally.
    fn quorum_change(
        &self,
        setup: &[u8],
        party_id: &str,
        old_keyshare: Option<&[u8]>,
    ) -> Result<Self::State, SessionError>;

    fn sign(
        &self,
        setup: &[u8],
        party_id: &str,
        keyshare: &[u8],
        message_hash: [u8; 32],
    ) -> Result<Self::State, SessionError>;

    fn keyshare_public_key(&self, keyshare: &[u8]) -> Result<[u8; 33], SessionError>;

    fn keyshare_key_id(&self, keyshare: &[u8]) -> Result<[u8; 32], SessionError>;
}
