//! Wire-level message and protocol constants.
//!
//! Every transported unit is one JSON object on one line:
//!
//! ```text
//! {"message": string, "senderIp": string, "senderId": string|null}
//! ```
//!
//! During the handshake `message` carries the introduction text, the nonce
//! challenge or the encrypted nonce. Afterwards it carries the base64
//! ciphertext of another JSON-encoded [`Message`].

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Well-known TCP port the coordinator listens on.
pub const DEFAULT_PORT: u16 = 9999;

/// Address the platform always assigns to the group owner.
pub const DEFAULT_COORDINATOR_ADDRESS: &str = "192.168.49.1";

/// Text of the unauthenticated introduction a member sends first.
pub const INTRODUCTION_TEXT: &str = "I am here";

/// Length of the hex-encoded nonce challenge.
pub const NONCE_HEX_LEN: usize = 32;

/// A chat message as it travels on the wire.
///
/// Immutable once constructed. Empty `text` is reserved for internal control
/// messages, which are never handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message")]
    text: String,
    #[serde(rename = "senderIp")]
    sender_address: String,
    #[serde(rename = "senderId", default)]
    sender_identifier: Option<String>,
}

impl Message {
    /// A plain message with no sender identifier.
    pub fn new(text: impl Into<String>, sender_address: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender_address: sender_address.into(),
            sender_identifier: None,
        }
    }

    /// A message that names the sender's identifier (handshake only).
    pub fn with_identifier(
        text: impl Into<String>,
        sender_address: impl Into<String>,
        sender_identifier: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            sender_address: sender_address.into(),
            sender_identifier: Some(sender_identifier.into()),
        }
    }

    /// The unauthenticated "I am here" introduction.
    pub fn introduction(sender_address: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::with_identifier(INTRODUCTION_TEXT, sender_address, identifier)
    }

    /// An internal control message (empty text).
    pub fn control(sender_address: impl Into<String>) -> Self {
        Self::new(String::new(), sender_address)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sender_address(&self) -> &str {
        &self.sender_address
    }

    pub fn sender_identifier(&self) -> Option<&str> {
        self.sender_identifier.as_deref()
    }

    pub fn is_introduction(&self) -> bool {
        self.text == INTRODUCTION_TEXT
    }

    pub fn is_control(&self) -> bool {
        self.text.is_empty()
    }

    /// Serialize to a single JSON line, without the trailing newline.
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self).map_err(crate::Error::serialization)
    }

    /// Parse one frame. Surrounding whitespace is ignored.
    pub fn from_frame(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
