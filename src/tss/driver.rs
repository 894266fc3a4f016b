//! In-process session coordination: step every active session, route each
//! emitted message to the recipient's inbound queue, repeat until all
//! sessions report done.

use tracing::warn;

use super::protocol::SessionBackend;
use super::{Session, SessionError};

/// A protocol round ought to complete in a handful of steps per party;
/// anything beyond this means a participant is missing or the protocol
/// stalled.
const MAX_ROUNDS: usize = 10_000;

/// Drive `sessions` to completion, routing messages between them by party
/// id. Messages addressed to parties without a local session are dropped
/// with a warning; their owners are remote and fed by the transport
/// instead.
pub fn run_to_completion<B: SessionBackend>(
    sessions: &mut [Session<B>],
) -> Result<(), SessionError> {
    for _ in 0..MAX_ROUNDS {
        let mut all_done = true;
        let mut routed = Vec::new();

        for session in sessions.iter_mut() {
            if session.is_finished() {
                continue;
            }
            let (messages, done) = session.step()?;
            if !done {
                all_done = false;
            }
            routed.extend(messages);
        }

        for message in routed {
            match sessions
                .iter_mut()
                .find(|s| s.party_id() == message.receiver)
            {
                Some(target) => target.input_message(&message.data)?,
                None => warn!(receiver = %message.receiver, "No local session for message receiver"),
            }
        }

        if all_done {
            return Ok(());
        }
    }

    Err(SessionError::Protocol(format!(
        "sessions did not complete within {MAX_ROUNDS} rounds"
    )))
}
