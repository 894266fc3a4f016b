//! One party's protocol session: bounded inbound queue, synchronous
//! stepping, and verified result extraction.

use std::collections::VecDeque;
use std::sync::Arc;

use ethers::core::k256::ecdsa::signature::hazmat::PrehashVerifier;
use ethers::core::k256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use super::protocol::{ProtocolOutput, ProtocolState, SessionBackend};
use super::{
    Message, SessionError, SessionKind, SessionOutcome, SessionResult, INBOUND_QUEUE_CAPACITY,
};

struct SignContext {
    key_id: [u8; 32],
    public_key: [u8; 33],
    message_hash: [u8; 32],
}

pub struct Session<B: SessionBackend> {
    kind: SessionKind,
    session_id: String,
    party_id: String,
    participants: Vec<String>,
    inbound: VecDeque<Vec<u8>>,
    state: Option<B::State>,
    finished: bool,
    sign: Option<SignContext>,
    /// Refresh (and quorum change, for existing parties): the result must
    /// carry this public key.
    expected_public_key: Option<[u8; 33]>,
    /// Quorum change: the result must NOT carry this key id.
    retiring_key_id: Option<[u8; 32]>,
}

fn validate_common(
    setup: &[u8],
    party_id: &str,
    participants: &[String],
) -> Result<(), SessionError> {
    if setup.is_empty() {
        return Err(SessionError::EmptySetup);
    }
    if party_id.is_empty() {
        return Err(SessionError::EmptyPartyId);
    }
    if participants.is_empty() {
        return Err(SessionError::NoParticipants);
    }
    Ok(())
}

impl<B: SessionBackend> Session<B> {
    #[instrument(skip_all, fields(session = %session_id, party = %party_id))]
    pub fn new_keygen(
        backend: Arc<B>,
        setup: &[u8],
        session_id: &str,
        party_id: &str,
        participants: Vec<String>,
    ) -> Result<Self, SessionError> {
        validate_common(setup, party_id, &participants)?;
        let state = backend.keygen(setup, party_id)?;
        Ok(Self::assemble(
            SessionKind::Keygen,
            session_id,
            party_id,
            participants,
            state,
            None,
            None,
            None,
        ))
    }

    #[instrument(skip_all, fields(session = %session_id, party = %party_id))]
    pub fn new_key_refresh(
        backend: Arc<B>,
        setup: &[u8],
        session_id: &str,
        party_id: &str,
        participants: Vec<String>,
        old_keyshare: &[u8],
    ) -> Result<Self, SessionError> {
        validate_common(setup, party_id, &participants)?;
        if old_keyshare.is_empty() {
            return Err(SessionError::EmptyKeyshare);
        }
        let expected = backend.keyshare_public_key(old_keyshare)?;
        let state = backend.key_refresh(setup, party_id, old_keyshare)?;
        Ok(Self::assemble(
            SessionKind::KeyRefresh,
            session_id,
            party_id,
            participants,
            state,
            None,
            Some(expected),
            None,
        ))
    }

    /// `old_keyshare` is absent for newly joining parties. The session
    /// owns its own copy of the share; the caller's buffer stays the
    /// caller's to free.
    #[instrument(skip_all, fields(session = %session_id, party = %party_id))]
    pub fn new_quorum_change(
        backend: Arc<B>,
        setup: &[u8],
        session_id: &str,
        party_id: &str,
        participants: Vec<String>,
        old_keyshare: Option<&[u8]>,
    ) -> Result<Self, SessionError> {
        validate_common(setup, party_id, &participants)?;
        let (expected, retiring) = match old_keyshare {
            Some(share) if !share.is_empty() => (
                Some(backend.keyshare_public_key(share)?),
                Some(backend.keyshare_key_id(share)?),
            ),
            _ => (None, None),
        };
        let state = backend.quorum_change(setup, party_id, old_keyshare)?;
        Ok(Self::assemble(
            SessionKind::QuorumChange,
            session_id,
            party_id,
            participants,
            state,
            None,
            expected,
            retiring,
        ))
    }

    #[instrument(skip_all, fields(session = %session_id, party = %party_id))]
    pub fn new_sign(
        backend: Arc<B>,
        setup: &[u8],
        session_id: &str,
        party_id: &str,
        participants: Vec<String>,
        keyshare: &[u8],
        message_hash: &[u8],
    ) -> Result<Self, SessionError> {
        validate_common(setup, party_id, &participants)?;
        if keyshare.is_empty() {
            return Err(SessionError::EmptyKeyshare);
        }
        let message_hash: [u8; 32] = message_hash
            .try_into()
            .map_err(|_| SessionError::InvalidMessageHash)?;

        let sign = SignContext {
            key_id: backend.keyshare_key_id(keyshare)?,
            public_key: backend.keyshare_public_key(keyshare)?,
            message_hash,
        };
        let state = backend.sign(setup, party_id, keyshare, message_hash)?;
        Ok(Self::assemble(
            SessionKind::Sign,
            session_id,
            party_id,
            participants,
            state,
            Some(sign),
            None,
            None,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        kind: SessionKind,
        session_id: &str,
        party_id: &str,
        participants: Vec<String>,
        state: B::State,
        sign: Option<SignContext>,
        expected_public_key: Option<[u8; 33]>,
        retiring_key_id: Option<[u8; 32]>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.to_owned(),
            party_id: party_id.to_owned(),
            participants,
            inbound: VecDeque::new(),
            state: Some(state),
            finished: false,
            sign,
            expected_public_key,
            retiring_key_id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        self.kind
    }

    #[must_use]
    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Enqueue an inbound protocol payload. The payload is copied; the
    /// queue is bounded at [`INBOUND_QUEUE_CAPACITY`].
    pub fn input_message(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.inbound.len() >= INBOUND_QUEUE_CAPACITY {
            return Err(SessionError::PayloadBufferFull);
        }
        self.inbound.push_back(data.to_vec());
        Ok(())
    }

    /// Advance the protocol: feed at most one queued inbound payload,
    /// then drain every currently-available outbound payload. Payloads
    /// addressed to this party loop back onto the inbound queue; the
    /// rest are returned for routing. A protocol error terminates the
    /// session.
    pub fn step(&mut self) -> Result<(Vec<Message>, bool), SessionError> {
        if self.finished {
            return Ok((Vec::new(), true));
        }
        match self.step_inner() {
            Ok(result) => Ok(result),
            Err(error) => {
                self.state = None;
                Err(error)
            }
        }
    }

    fn step_inner(&mut self) -> Result<(Vec<Message>, bool), SessionError> {
        let state = self.state.as_mut().ok_or(SessionError::Closed)?;

        if let Some(payload) = self.inbound.pop_front() {
            if state.input_message(&payload)? {
                self.finished = true;
                debug!(session = %self.session_id, party = %self.party_id, "Session finished");
                return Ok((Vec::new(), true));
            }
        }

        let mut messages = Vec::new();
        while let Some(payload) = state.output_message()? {
            let mut index = 0;
            while let Some(receiver) = state.message_receiver(&payload, index)? {
                if receiver == self.party_id {
                    if self.inbound.len() >= INBOUND_QUEUE_CAPACITY {
                        return Err(SessionError::PayloadBufferFull);
                    }
                    self.inbound.push_back(payload.clone());
                } else {
                    messages.push(Message {
                        receiver,
                        data: payload.clone(),
                    });
                }
                index += 1;
            }
        }

        Ok((messages, false))
    }

    /// Finalize the native state and hand out the result, exactly once.
    /// Sign results are verified against the session key before release.
    pub fn get_result(&mut self) -> Result<SessionResult, SessionError> {
        if !self.finished {
            return Err(SessionError::NotFinished);
        }
        let state = self.state.take().ok_or(SessionError::ResultTaken)?;
        let output = Box::new(state).finish()?;

        let (key_id, public_key, outcome) = match (self.kind, output) {
            (SessionKind::Sign, ProtocolOutput::Signature(signature)) => {
                let context = self
                    .sign
                    .as_ref()
                    .ok_or_else(|| SessionError::Protocol("sign context missing".into()))?;
                verify_signature(&context.public_key, &context.message_hash, &signature)?;
                (
                    context.key_id,
                    context.public_key,
                    SessionOutcome::Signature(signature),
                )
            }
            (
                SessionKind::Keygen | SessionKind::KeyRefresh | SessionKind::QuorumChange,
                ProtocolOutput::Keyshare {
                    share,
                    public_key,
                    key_id,
                },
            ) => {
                if let Some(expected) = self.expected_public_key {
                    if public_key != expected {
                        return Err(SessionError::PublicKeyMismatch);
                    }
                }
                if self.kind == SessionKind::QuorumChange {
                    if let Some(retiring) = self.retiring_key_id {
                        if key_id == retiring {
                            return Err(SessionError::KeyIdNotRotated);
                        }
                    }
                }
                (
                    key_id,
                    public_key,
                    SessionOutcome::Keyshare(Zeroizing::new(share)),
                )
            }
            _ => {
                return Err(SessionError::Protocol(
                    "protocol output does not match session kind".into(),
                ))
            }
        };

        Ok(SessionResult {
            kind: self.kind,
            session_id: self.session_id.clone(),
            participants: self.participants.clone(),
            key_id: hex::encode(key_id),
            public_key,
            outcome,
        })
    }

    /// Release native resources. Closing twice is a no-op. A quorum
    /// change session nulls its reference without invoking the native
    /// free; the library ties that handle's lifetime to the retiring
    /// keyshare, which the caller frees.
    pub fn close(&mut self) {
        match self.state.take() {
            None => {}
            Some(state) if self.kind == SessionKind::QuorumChange => {
                std::mem::forget(state);
            }
            Some(state) => drop(state),
        }
    }
}

fn verify_signature(
    public_key: &[u8; 33],
    message_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), SessionError> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| SessionError::SignatureVerificationFailed)?;
    let signature = EcdsaSignature::from_slice(signature)
        .map_err(|_| SessionError::SignatureVerificationFailed)?;
    key.verify_prehash(message_hash, &signature)
        .map_err(|_| SessionError::SignatureVerificationFailed)
}

/// Toy backend driving the engine in tests: a broadcast-and-collect
/// protocol whose keys are real secp256k1 keys derived from the setup
/// seed, so signature and public-key checks are exercised for real.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use ethers::core::k256::ecdsa::SigningKey;
    use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
    use ethers::utils::keccak256;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TestSetup {
        pub seed: Vec<u8>,
        pub participants: Vec<String>,
        #[serde(default)]
        pub nonce: u64,
    }

    impl TestSetup {
        pub fn encode(&self) -> Vec<u8> {
            serde_json::to_vec(self).unwrap()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TestKeyshare {
        pub party: String,
        pub seed: Vec<u8>,
        pub participants: Vec<String>,
        pub nonce: u64,
    }

    fn signing_key(seed: &[u8]) -> SigningKey {
        SigningKey::from_slice(&keccak256(seed)).unwrap()
    }

    fn public_key(seed: &[u8]) -> [u8; 33] {
        let point = signing_key(seed).verifying_key().to_encoded_point(true);
        point.as_bytes().try_into().unwrap()
    }

    fn key_id(seed: &[u8], participants: &[String]) -> [u8; 32] {
        let mut data = seed.to_vec();
        data.extend(participants.join(",").into_bytes());
        keccak256(&data)
    }

    pub struct TestState {
        party_id: String,
        setup: TestSetup,
        outbox: Vec<Vec<u8>>,
        received: BTreeSet<String>,
        message_hash: Option<[u8; 32]>,
        corrupt_signature: bool,
        drops: Option<Arc<AtomicUsize>>,
    }

    impl Drop for TestState {
        fn drop(&mut self) {
            if let Some(drops) = &self.drops {
                drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl ProtocolState for TestState {
        fn input_message(&mut self, payload: &[u8]) -> Result<bool, SessionError> {
            let from: String = serde_json::from_slice(payload)
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            self.received.insert(from);
            Ok(self
                .setup
                .participants
                .iter()
                .all(|p| self.received.contains(p)))
        }

        fn output_message(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
            Ok(self.outbox.pop())
        }

        fn message_receiver(
            &self,
            _payload: &[u8],
            index: usize,
        ) -> Result<Option<String>, SessionError> {
            // Every payload is a broadcast, the local party included, so
            // the engine's self-loop path is exercised.
            Ok(self.setup.participants.get(index).cloned())
        }

        fn finish(self: Box<Self>) -> Result<ProtocolOutput, SessionError> {
            match self.message_hash {
                Some(hash) => {
                    let (signature, _) = signing_key(&self.setup.seed)
                        .sign_prehash_recoverable(&hash)
                        .map_err(|e| SessionError::Protocol(e.to_string()))?;
                    let mut raw: [u8; 64] = signature.to_bytes().into();
                    if self.corrupt_signature {
                        raw[17] ^= 0xff;
                    }
                    Ok(ProtocolOutput::Signature(raw))
                }
                None => {
                    let share = TestKeyshare {
                        party: self.party_id.clone(),
                        seed: self.setup.seed.clone(),
                        participants: self.setup.participants.clone(),
                        nonce: self.setup.nonce,
                    };
                    Ok(ProtocolOutput::Keyshare {
                        share: serde_json::to_vec(&share).unwrap(),
                        public_key: public_key(&self.setup.seed),
                        key_id: key_id(&self.setup.seed, &self.setup.participants),
                    })
                }
            }
        }
    }

    #[derive(Default)]
    pub struct TestBackend {
        pub corrupt_signature: bool,
        pub drops: Option<Arc<AtomicUsize>>,
    }

    impl TestBackend {
        fn state(
            &self,
            setup: &[u8],
            party_id: &str,
            message_hash: Option<[u8; 32]>,
        ) -> Result<TestState, SessionError> {
            let setup: TestSetup = serde_json::from_slice(setup)
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            let announce = serde_json::to_vec(&party_id.to_owned()).unwrap();
            Ok(TestState {
                party_id: party_id.to_owned(),
                setup,
                outbox: vec![announce],
                received: BTreeSet::new(),
                message_hash,
                corrupt_signature: self.corrupt_signature,
                drops: self.drops.clone(),
            })
        }

        fn parse_share(keyshare: &[u8]) -> Result<TestKeyshare, SessionError> {
            serde_json::from_slice(keyshare).map_err(|e| SessionError::Protocol(e.to_string()))
        }
    }

    impl SessionBackend for TestBackend {
        type State = TestState;

        fn keygen(&self, setup: &[u8], party_id: &str) -> Result<Self::State, SessionError> {
            self.state(setup, party_id, None)
        }

        fn key_refresh(
            &self,
            setup: &[u8],
            party_id: &str,
            _old_keyshare: &[u8],
        ) -> Result<Self::State, SessionError> {
            self.state(setup, party_id, None)
        }

        fn quorum_change(
            &self,
            setup: &[u8],
            party_id: &str,
            _old_keyshare: Option<&[u8]>,
        ) -> Result<Self::State, SessionError> {
            self.state(setup, party_id, None)
        }

        fn sign(
            &self,
            setup: &[u8],
            party_id: &str,
            keyshare: &[u8],
            message_hash: [u8; 32],
        ) -> Result<Self::State, SessionError> {
            let share = Self::parse_share(keyshare)?;
            let mut state = self.state(setup, party_id, Some(message_hash))?;
            // The signing key comes from the keyshare, not the setup.
            state.setup.seed = share.seed;
            Ok(state)
        }

        fn keyshare_public_key(&self, keyshare: &[u8]) -> Result<[u8; 33], SessionError> {
            Ok(public_key(&Self::parse_share(keyshare)?.seed))
        }

        fn keyshare_key_id(&self, keyshare: &[u8]) -> Result<[u8; 32], SessionError> {
            let share = Self::parse_share(keyshare)?;
            Ok(key_id(&share.seed, &share.participants))
        }
    }

    pub fn participants(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("party-{i}")).collect()
    }

    pub fn setup(seed: &[u8], parties: &[String], nonce: u64) -> Vec<u8> {
        TestSetup {
            seed: seed.to_vec(),
            participants: parties.to_vec(),
            nonce,
        }
        .encode()
    }
}
