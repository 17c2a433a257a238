//! Streaming symmetric signcryption
//!
//! Seals arbitrarily large plaintexts under a shared symmetric key while
//! binding every chunk to the sender's Ed25519 signing key.
//!
//! # Stream layout
//!
//! The plaintext is cut into `chunk_size` pieces. Every full piece is a
//! non-final chunk; the remainder (possibly empty) is always emitted as the
//! single final chunk. Each chunk is framed as
//!
//!   [ len (u32 BE) | XChaCha20-Poly1305(sig(64) || chunk, aad = [final]) ]
//!
//! with nonce `prefix(16) || index(u64 BE)`. The signature covers
//!
//!   sha256(key) || nonce || final || sha512(chunk)
//!
//! so a chunk cannot be moved to another key, position or stream, and the
//! final flag detects truncation and extension.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::{
    aead,
    error::CryptoError,
    hash::{sha256, sha512},
    identity::{SigningKeyPair, VerifyKey},
};

pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
/// Largest chunk whose frame length still fits the u32 length prefix.
pub const MAX_CHUNK_SIZE: usize = 1 << 30;
pub const NONCE_PREFIX_LEN: usize = 16;

const SIG_LEN: usize = 64;
const LEN_PREFIX: usize = 4;
const SIGNATURE_PREFIX: &[u8] = b"cb-signencrypt-chunk-v1";

/// Output of [`seal`]: the random nonce prefix plus the framed chunk stream.
#[derive(Debug, Clone)]
pub struct SignencryptedStream {
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
    pub ciphertext: Vec<u8>,
}

pub fn seal(
    plaintext: &[u8],
    key: &[u8; 32],
    signer: &SigningKeyPair,
    chunk_size: usize,
) -> Result<SignencryptedStream, CryptoError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CryptoError::MalformedStream(format!(
            "chunk size must be in 1..={MAX_CHUNK_SIZE}, got {chunk_size}"
        )));
    }
    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut nonce_prefix);

    let key_digest = sha256(key);
    let full_chunks = plaintext.len() / chunk_size;
    let mut ciphertext = Vec::with_capacity(
        plaintext.len() + (full_chunks + 1) * (LEN_PREFIX + SIG_LEN + aead::TAG_LEN),
    );

    let mut rest = plaintext;
    let mut index = 0u64;
    loop {
        let is_final = rest.len() < chunk_size;
        let (chunk, tail) = if is_final {
            (rest, &rest[rest.len()..])
        } else {
            rest.split_at(chunk_size)
        };

        let nonce = chunk_nonce(&nonce_prefix, index);
        let sig = signer.sign(
            SIGNATURE_PREFIX,
            &signature_input(&key_digest, &nonce, is_final, chunk),
        );

        let mut inner = Zeroizing::new(Vec::with_capacity(SIG_LEN + chunk.len()));
        inner.extend_from_slice(&sig);
        inner.extend_from_slice(chunk);
        let sealed = aead::seal(key, &nonce, &inner, &[is_final as u8])?;

        let frame_len = u32::try_from(sealed.len())
            .map_err(|_| CryptoError::MalformedStream("chunk frame exceeds u32 length".into()))?;
        ciphertext.extend_from_slice(&frame_len.to_be_bytes());
        ciphertext.extend_from_slice(&sealed);

        if is_final {
            break;
        }
        rest = tail;
        index += 1;
    }

    Ok(SignencryptedStream {
        nonce_prefix,
        ciphertext,
    })
}

/// Open a stream produced by [`seal`], verifying every chunk against
/// `verify_key`.
pub fn open(
    ciphertext: &[u8],
    key: &[u8; 32],
    nonce_prefix: &[u8],
    verify_key: &VerifyKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce_prefix: &[u8; NONCE_PREFIX_LEN] =
        nonce_prefix
            .try_into()
            .map_err(|_| CryptoError::BadNonce {
                expected: NONCE_PREFIX_LEN,
                actual: nonce_prefix.len(),
            })?;

    let key_digest = sha256(key);
    let mut plaintext = Zeroizing::new(Vec::with_capacity(ciphertext.len()));
    let mut rest = ciphertext;
    let mut index = 0u64;

    loop {
        if rest.is_empty() {
            return Err(CryptoError::MalformedStream(format!(
                "stream ended after {index} chunks without a final chunk"
            )));
        }
        let (sealed, tail) = next_frame(rest)?;
        let is_final = tail.is_empty();
        let nonce = chunk_nonce(nonce_prefix, index);

        // The final flag is authenticated as AAD: a non-final chunk opened
        // as final (or the reverse) fails here.
        let inner = aead::open(key, &nonce, sealed, &[is_final as u8])?;
        if inner.len() < SIG_LEN {
            return Err(CryptoError::MalformedStream("chunk shorter than signature".into()));
        }
        let (sig, chunk) = inner.split_at(SIG_LEN);
        verify_key.verify(
            SIGNATURE_PREFIX,
            &signature_input(&key_digest, &nonce, is_final, chunk),
            sig,
        )?;
        plaintext.extend_from_slice(chunk);

        if is_final {
            return Ok(plaintext);
        }
        rest = tail;
        index += 1;
    }
}

fn next_frame(buf: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    if buf.len() < LEN_PREFIX {
        return Err(CryptoError::MalformedStream("truncated length prefix".into()));
    }
    let (len_bytes, rest) = buf.split_at(LEN_PREFIX);
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(len_bytes);
    let len = u32::from_be_bytes(len) as usize;
    if rest.len() < len {
        return Err(CryptoError::MalformedStream(format!(
            "chunk claims {len} bytes, {} available",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], index: u64) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn signature_input(
    key_digest: &[u8; 32],
    nonce: &[u8; aead::NONCE_LEN],
    is_final: bool,
    chunk: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + aead::NONCE_LEN + 1 + 64);
    out.extend_from_slice(key_digest);
    out.extend_from_slice(nonce);
    out.push(is_final as u8);
    out.extend_from_slice(&sha512(chunk));
    out
}
