//! cb_crypto: primitives for sealing and opening chat message boxes
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key material is never generated for real use or persisted here; the
//!   caller lends it for the duration of one call.
//!
//! # Module layout
//! - `aead`         XChaCha20-Poly1305 seal/open with explicit nonces
//! - `hash`         SHA-256/512 digests, BLAKE3 identifiers, constant-time eq
//! - `identity`     Ed25519 signing keys (incl. dummy signer), X25519 DH keys, key IDs
//! - `keys`         conversation and ephemeral symmetric key newtypes
//! - `signencrypt`  chunked streaming signcryption
//! - `pairwise`     per-recipient-device HMAC authenticators
//! - `error`        unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod keys;
pub mod pairwise;
pub mod signencrypt;

pub use error::CryptoError;
pub use identity::{DhKeyPair, DhPublicKey, KeyId, KeyType, SigningKeyPair, VerifyKey};
pub use keys::{ConversationKey, EphemeralKey};
