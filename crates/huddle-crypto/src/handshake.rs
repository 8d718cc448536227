//! Nonce challenge-response handshake.
//!
//! Sans-IO: both sides consume and produce [`Message`] values, the transport
//! moves them. The exchange:
//!
//! ```text
//! member                                   coordinator
//!   │ {"I am here", addr, id}  ─────────────▶ │  Responder::challenge
//!   │ ◀───────────── {nonce, coordinator}     │
//!   │ {encrypt(nonce), addr, id} ───────────▶ │  Responder::verify
//!   │ ◀───────── seal({"", coordinator})      │  (sent only on success)
//!   ▼ Initiator::confirm                      ▼
//! ```
//!
//! The coordinator derives the member's key from the identifier the member
//! claims. Without a roster any identifier is accepted as long as the member
//! can encrypt the nonce under it.

use std::collections::HashSet;
use std::sync::Arc;

use huddle_common::{helpers::constant_time_eq, Message, NONCE_HEX_LEN};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::debug;

use crate::cipher::CipherError;
use crate::envelope;
use crate::keys::KeyMaterial;

/// Errors during the handshake. All of them end the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("identifier not provided")]
    MissingIdentifier,

    #[error("identifier '{0}' is not on the roster")]
    NotOnRoster(String),

    #[error("nonce response did not match")]
    Mismatch,

    #[error("handshake step out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),
}

impl From<HandshakeError> for huddle_common::Error {
    fn from(err: HandshakeError) -> Self {
        huddle_common::Error::auth(err)
    }
}

/// A fresh nonce: 16 random bytes as 32 lowercase hex characters.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_HEX_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum InitiatorState {
    /// Waiting to send the introduction
    Init,
    /// Sent the introduction, waiting for the nonce
    SentIntroduction,
    /// Answered the nonce, waiting for the coordinator's acknowledgement
    AnsweredChallenge(KeyMaterial),
    /// Finished, successfully or not
    Done,
}

/// Member side of the handshake.
pub struct Initiator {
    identifier: String,
    local_address: String,
    state: InitiatorState,
}

impl Initiator {
    pub fn new(identifier: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            local_address: local_address.into(),
            state: InitiatorState::Init,
        }
    }

    /// The unauthenticated introduction.
    pub fn start(&mut self) -> Result<Message, HandshakeError> {
        if !matches!(self.state, InitiatorState::Init) {
            return Err(HandshakeError::OutOfOrder("introduction already sent"));
        }
        self.state = InitiatorState::SentIntroduction;
        Ok(Message::introduction(&self.local_address, &self.identifier))
    }

    /// Encrypt the coordinator's nonce under our derived key.
    pub fn answer_challenge(&mut self, challenge: &Message) -> Result<Message, HandshakeError> {
        if !matches!(self.state, InitiatorState::SentIntroduction) {
            return Err(HandshakeError::OutOfOrder("no challenge expected"));
        }
        self.state = InitiatorState::Done;

        let nonce = challenge.text();
        if nonce.is_empty() || challenge.is_introduction() {
            return Err(HandshakeError::Malformed("challenge carries no nonce".into()));
        }
        debug!(coordinator = challenge.sender_address(), "received nonce challenge");

        let keys = KeyMaterial::derive(&self.identifier);
        let response = keys.encrypt(nonce)?;
        self.state = InitiatorState::AnsweredChallenge(keys);

        Ok(Message::with_identifier(
            response,
            &self.local_address,
            &self.identifier,
        ))
    }

    /// Check the coordinator's sealed acknowledgement and hand over the keys.
    ///
    /// The acknowledgement only opens under the key the coordinator derived for
    /// us, so a successful open proves both sides agree.
    pub fn confirm(mut self, acknowledgement: &Message) -> Result<KeyMaterial, HandshakeError> {
        let InitiatorState::AnsweredChallenge(keys) =
            std::mem::replace(&mut self.state, InitiatorState::Done)
        else {
            return Err(HandshakeError::OutOfOrder("challenge not answered"));
        };

        let inner = envelope::open(acknowledgement, &keys)
            .map_err(|e| HandshakeError::Malformed(format!("acknowledgement: {e}")))?;
        if !inner.is_control() {
            return Err(HandshakeError::Malformed(
                "acknowledgement is not a control message".into(),
            ));
        }
        Ok(keys)
    }

    pub fn is_awaiting_acknowledgement(&self) -> bool {
        matches!(self.state, InitiatorState::AnsweredChallenge(_))
    }
}

/// Coordinator-side record of an issued challenge.
///
/// Lives only between the challenge and the verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub nonce: String,
    pub claimed_identifier: Option<String>,
}

enum ResponderState {
    /// Waiting for the introduction
    Init,
    /// Challenge issued, waiting for the encrypted nonce
    Challenged(PendingChallenge),
    /// Finished, successfully or not
    Done,
}

/// Coordinator side of the handshake.
pub struct Responder {
    coordinator_address: String,
    roster: Option<Arc<HashSet<String>>>,
    state: ResponderState,
    verified_identifier: Option<String>,
}

impl Responder {
    pub fn new(coordinator_address: impl Into<String>) -> Self {
        Self {
            coordinator_address: coordinator_address.into(),
            roster: None,
            state: ResponderState::Init,
            verified_identifier: None,
        }
    }

    /// Only accept identifiers in `roster`.
    pub fn with_roster(mut self, roster: Arc<HashSet<String>>) -> Self {
        self.roster = Some(roster);
        self
    }

    /// Answer an introduction with a fresh nonce.
    pub fn challenge(&mut self, introduction: &Message) -> Result<Message, HandshakeError> {
        self.challenge_with_nonce(introduction, generate_nonce())
    }

    /// Answer an introduction with a caller-chosen nonce.
    pub fn challenge_with_nonce(
        &mut self,
        introduction: &Message,
        nonce: String,
    ) -> Result<Message, HandshakeError> {
        if !matches!(self.state, ResponderState::Init) {
            return Err(HandshakeError::OutOfOrder("challenge already issued"));
        }
        if !introduction.is_introduction() {
            self.state = ResponderState::Done;
            return Err(HandshakeError::Malformed(format!(
                "expected introduction, got {:?}",
                truncate(introduction.text())
            )));
        }

        let challenge = Message::new(nonce.clone(), &self.coordinator_address);
        self.state = ResponderState::Challenged(PendingChallenge {
            nonce,
            claimed_identifier: introduction.sender_identifier().map(str::to_owned),
        });
        Ok(challenge)
    }

    /// Verify the encrypted nonce against the claimed identifier.
    ///
    /// On success returns the peer's key material. The pending challenge is
    /// discarded either way.
    pub fn verify(&mut self, response: &Message) -> Result<KeyMaterial, HandshakeError> {
        let ResponderState::Challenged(pending) =
            std::mem::replace(&mut self.state, ResponderState::Done)
        else {
            return Err(HandshakeError::OutOfOrder("no challenge outstanding"));
        };

        let claimed = match (response.sender_identifier(), pending.claimed_identifier.as_deref())
        {
            (Some(answer), Some(intro)) if answer != intro => {
                return Err(HandshakeError::Malformed(
                    "identifier changed during handshake".into(),
                ))
            }
            (Some(id), _) | (None, Some(id)) => id.to_owned(),
            (None, None) => return Err(HandshakeError::MissingIdentifier),
        };

        if let Some(roster) = &self.roster {
            if !roster.contains(&claimed) {
                return Err(HandshakeError::NotOnRoster(claimed));
            }
        }

        let keys = KeyMaterial::derive(&claimed);
        let expected = keys.encrypt(&pending.nonce)?;
        if !constant_time_eq(&expected, response.text().trim()) {
            return Err(HandshakeError::Mismatch);
        }

        self.verified_identifier = Some(claimed);
        Ok(keys)
    }

    /// Identifier proven by a successful [`Responder::verify`].
    pub fn verified_identifier(&self) -> Option<&str> {
        self.verified_identifier.as_deref()
    }

    /// The outstanding challenge, if any.
    pub fn pending(&self) -> Option<&PendingChallenge> {
        match &self.state {
            ResponderState::Challenged(pending) => Some(pending),
            _ => None,
        }
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(32) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
