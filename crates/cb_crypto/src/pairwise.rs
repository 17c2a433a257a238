//! Per-recipient-device pairwise authenticators.
//!
//! raw    = HSalsa20(X25519(my, their), 0^16)       (NaCl box_beforenm)
//! tagkey = HMAC-SHA256(raw, PAIRWISE_CONTEXT)
//! tag    = HMAC-SHA256(tagkey, input)
//!
//! Sender and recipient derive the same tag key from opposite halves of the
//! DH exchange, so a valid tag proves the sender held the private half of
//! the advertised DH key.

use hmac::{Hmac, Mac};
use salsa20::cipher::{consts::U10, generic_array::GenericArray};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    hash::ct_eq,
    identity::{DhKeyPair, DhPublicKey, KeyId},
};

pub const PAIRWISE_CONTEXT: &[u8] = b"Derived-Chat-Pairwise-HMAC-SHA256-1";
pub const MAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("HMAC key: {e}")))?;
    mac.update(msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn tag_key(my: &DhKeyPair, their: &DhPublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = Zeroizing::new(my.diffie_hellman(their));
    let mut raw = Zeroizing::new([0u8; 32]);
    raw.copy_from_slice(&salsa20::hsalsa::<U10>(
        GenericArray::from_slice(shared.as_slice()),
        &GenericArray::default(),
    ));
    Ok(Zeroizing::new(hmac_sha256(raw.as_slice(), PAIRWISE_CONTEXT)?))
}

/// Bytes every pairwise tag covers: the header nonce followed by the header
/// ciphertext.
pub fn mac_input(header_nonce: &[u8], header_ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_nonce.len() + header_ciphertext.len());
    out.extend_from_slice(header_nonce);
    out.extend_from_slice(header_ciphertext);
    out
}

pub fn make_mac(my: &DhKeyPair, their: &DhPublicKey, input: &[u8]) -> Result<[u8; MAC_LEN], CryptoError> {
    let key = tag_key(my, their)?;
    hmac_sha256(key.as_slice(), input)
}

/// One tag per recipient device, keyed by the recipient's DH key ID.
pub fn make_macs(
    sender: &DhKeyPair,
    recipients: &[DhPublicKey],
    input: &[u8],
) -> Result<Vec<(KeyId, [u8; MAC_LEN])>, CryptoError> {
    recipients
        .iter()
        .map(|r| Ok((r.key_id(), make_mac(sender, r, input)?)))
        .collect()
}

/// Recompute the tag from the recipient side and compare in constant time.
pub fn verify_mac(
    recipient: &DhKeyPair,
    sender: &DhPublicKey,
    input: &[u8],
    tag: &[u8],
) -> Result<bool, CryptoError> {
    let expected = make_mac(recipient, sender, input)?;
    Ok(ct_eq(&expected, tag))
}
