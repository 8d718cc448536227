//! Authenticated wire frames.
//!
//! After the handshake every [`Message`] travels inside another one: the outer
//! message's text is the encrypted JSON of the inner message, and its sender
//! address is copied from the inner message so relays can log it without
//! decrypting.

use huddle_common::{Error, Message, Result};

use crate::keys::KeyMaterial;

/// Encrypt `message` into a transport frame for the peer owning `keys`.
pub fn seal(message: &Message, keys: &KeyMaterial) -> Result<Message> {
    let inner = message.to_frame()?;
    let ciphertext = keys.encrypt(&inner)?;
    Ok(Message::new(ciphertext, message.sender_address()))
}

/// Decrypt a transport frame and parse the inner message.
///
/// Undecryptable frames yield [`Error::Crypto`], frames that decrypt to
/// something other than a message yield [`Error::Protocol`].
pub fn open(frame: &Message, keys: &KeyMaterial) -> Result<Message> {
    let inner = keys.decrypt(frame.text())?;
    Message::from_frame(&inner)
        .map_err(|e| Error::protocol(format!("sealed payload is not a message: {e}")))
}
