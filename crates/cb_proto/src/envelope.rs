//! Boxed message: what the server stores and relays.
//!
//! The server sees:
//!   - `client_header` (unsealed copy, needed for routing and indexing)
//!   - `version`, `key_generation`, `verify_key`
//!   - both ciphertexts (opaque)
//!   - pairwise tags keyed by recipient device key ID
//!
//! and attaches `server_header` after receipt. The client never signs the
//! server header; the unboxer binds its message ID to the body hash instead.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use cb_crypto::{hash::sha256_parts, DhPublicKey, KeyId};

use crate::message::{MessageClientHeader, MessageId};

/// One sealed blob. `v` is the boxed version the blob was sealed under,
/// `n` the nonce (24 bytes for v1, a 16-byte stream prefix for v2+).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncryptedData {
    pub v: u32,
    #[serde(with = "serde_bytes")]
    pub e: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub n: Vec<u8>,
}

impl EncryptedData {
    /// SHA-256(v BE32 || n || e): commits to every field of the sealed blob.
    pub fn digest(&self) -> [u8; 32] {
        sha256_parts(&[&self.v.to_be_bytes(), &self.n, &self.e])
    }

    /// Digest of a body blob, committed inside the sealed header so the
    /// body cannot be swapped.
    pub fn body_hash(&self) -> [u8; 32] {
        self.digest()
    }

    /// Server-side deletion leaves an empty ciphertext behind.
    pub fn is_deleted(&self) -> bool {
        self.e.is_empty()
    }
}

/// Detached Ed25519 signature carried inside a v1 header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub v: u32,
    #[serde(with = "serde_bytes")]
    pub s: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>,
}

/// Fields the server assigns after receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHeader {
    pub message_id: MessageId,
    pub ctime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<MessageId>,
}

/// v3+ per-device authenticators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseMacs {
    /// Sender's DH public key for this message.
    pub sender_key: DhPublicKey,
    pub macs: BTreeMap<KeyId, ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxedMessage {
    pub version: u32,
    pub client_header: MessageClientHeader,
    pub header_ciphertext: EncryptedData,
    pub body_ciphertext: EncryptedData,
    /// Ed25519 verify key of the signer. Empty for v1, where the key rides
    /// inside the sealed header signature.
    #[serde(with = "serde_bytes", default)]
    pub verify_key: Vec<u8>,
    pub key_generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairwise: Option<PairwiseMacs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_header: Option<ServerHeader>,
}

impl BoxedMessage {
    /// Digest of the whole sealed header (version, nonce and ciphertext).
    /// This is what previous-pointers commit to.
    pub fn header_hash(&self) -> [u8; 32] {
        self.header_ciphertext.digest()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.server_header.as_ref().map(|h| h.message_id)
    }
}
