//! Cryptographic primitives for Huddle.
//!
//! This crate provides:
//! - Identifier key derivation (SHA-256 digest -> AES key and IV)
//! - AES-256-CBC encryption of UTF-8 text to base64
//! - Sealing and opening of authenticated wire frames
//! - Sans-IO state machines for the nonce challenge-response handshake
//!
//! # Design
//!
//! A member proves it knows its identifier by encrypting a coordinator-issued
//! nonce with the key derived from that identifier. The coordinator derives the
//! same key from the claimed identifier and compares ciphertexts.
//!
//! # Security
//!
//! Derivation is deterministic and unsalted, so a session's keys are the same
//! every time the same identifier joins, and identifiers drawn from a small
//! numeric range can be brute-forced. The handshake depends on that
//! determinism: the coordinator has no other way to learn a member's key.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod envelope;
pub mod handshake;
pub mod keys;

pub use cipher::{decrypt, encrypt, CipherError};
pub use envelope::{open, seal};
pub use handshake::{generate_nonce, HandshakeError, Initiator, PendingChallenge, Responder};
pub use keys::{derive_iv, derive_key, hash_identifier, IdentifierDigest, KeyMaterial};
