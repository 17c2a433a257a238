use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed")]
    AeadDecrypt,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signcrypted stream truncated or malformed: {0}")]
    MalformedStream(String),

    #[error("Nonce must be {expected} bytes, got {actual}")]
    BadNonce { expected: usize, actual: usize },
}
