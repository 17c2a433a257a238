//! Device key material consumed by the boxer.
//!
//! Each *device* owns one Ed25519 `SigningKeyPair` (message signatures) and
//! one X25519 `DhKeyPair` (pairwise authenticators). Neither is generated
//! for real use here; callers load them from their keyring and lend them to
//! a single box/unbox call.
//!
//! Keys are identified on the wire by a `KeyId`:
//!
//!   [ key type (1 byte) | public key (32 bytes) ]
//!
//! so a signing key and a DH key with identical bytes never collide.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Key identifiers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyType {
    Ed25519Signing = 0x20,
    X25519Dh = 0x21,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(#[serde(with = "serde_bytes")] Vec<u8>);

impl KeyId {
    pub fn new(key_type: KeyType, public: &[u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(33);
        bytes.push(key_type as u8);
        bytes.extend_from_slice(public);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn key_type(&self) -> Option<KeyType> {
        match self.0.first() {
            Some(0x20) => Some(KeyType::Ed25519Signing),
            Some(0x21) => Some(KeyType::X25519Dh),
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ── Signing keys ──────────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key as recovered from a box.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerifyKey(#[serde(with = "serde_bytes")] Vec<u8>);

impl VerifyKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Verify key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn key_id(&self) -> KeyId {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&self.0);
        KeyId::new(KeyType::Ed25519Signing, &arr)
    }

    /// True if this is the public half of [`SigningKeyPair::dummy`].
    pub fn is_dummy(&self) -> bool {
        self.0 == SigningKeyPair::dummy().public.0
    }

    /// Verify `sig` over `prefix || 0x00 || msg`.
    pub fn verify(&self, prefix: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let bytes: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad verify key len".into()))?;
        // A corrupted key that is not a curve point can only fail verification.
        let vk = VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::SignatureVerification)?;
        let sig = Signature::from_bytes(
            sig.try_into()
                .map_err(|_| CryptoError::SignatureVerification)?,
        );
        vk.verify(&prefixed(prefix, msg), &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyKey({})", hex::encode(&self.0))
    }
}

/// Device signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    pub public: VerifyKey,
    secret_bytes: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_seed(signing_key.to_bytes())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public = VerifyKey(signing_key.verifying_key().to_bytes().to_vec());
        Self {
            public,
            secret_bytes: seed,
        }
    }

    /// Synthetic signer with an all-zero seed. Anyone can produce its
    /// signatures, so it only satisfies the envelope format; authenticity
    /// must come from pairwise authenticators.
    pub fn dummy() -> Self {
        Self::from_seed([0u8; 32])
    }

    pub fn key_id(&self) -> KeyId {
        self.public.key_id()
    }

    /// Sign `prefix || 0x00 || msg`; returns 64-byte raw Ed25519 signature.
    pub fn sign(&self, prefix: &[u8], msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret_bytes)
            .sign(&prefixed(prefix, msg))
            .to_bytes()
    }
}

/// Signature prefixes keep a signature made for one purpose from verifying
/// in another.
fn prefixed(prefix: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1 + msg.len());
    out.extend_from_slice(prefix);
    out.push(0);
    out.extend_from_slice(msg);
    out
}

// ── DH keys ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhPublicKey(pub [u8; 32]);

impl DhPublicKey {
    pub fn key_id(&self) -> KeyId {
        KeyId::new(KeyType::X25519Dh, &self.0)
    }

    pub(crate) fn to_x25519(self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl fmt::Debug for DhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhPublicKey({})", hex::encode(self.0))
    }
}

/// X25519 device encryption key.
#[derive(ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    pub public: DhPublicKey,
    secret_bytes: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret.to_bytes())
    }

    pub fn from_secret(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = DhPublicKey(X25519Public::from(&secret).to_bytes());
        Self {
            public,
            secret_bytes,
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.public.key_id()
    }

    pub(crate) fn diffie_hellman(&self, their: &DhPublicKey) -> [u8; 32] {
        StaticSecret::from(self.secret_bytes)
            .diffie_hellman(&their.to_x25519())
            .to_bytes()
    }
}
