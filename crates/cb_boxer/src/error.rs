use thiserror::Error;

use cb_crypto::CryptoError;
use cb_proto::{
    version::{BoxedVersion, VersionKind, VersionLimits},
    CodecError, MessageId, MessageType,
};

// ── Box-time errors (always permanent) ────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BoxingError {
    #[error("Unsupported boxed version {0}")]
    UnsupportedVersion(u32),

    #[error("Boxed version {version} is above the configured maximum {max}")]
    VersionAboveMax { version: u32, max: u32 },

    #[error("Ephemeral messages need boxed version v3 or later, got {0}")]
    EphemeralNotSupported(BoxedVersion),

    #[error("Ephemeral key does not match the message: {0}")]
    EphemeralKeyMismatch(String),

    #[error("Pairwise MACs need boxed version v3 or later, got {0}")]
    PairwiseNotSupported(BoxedVersion),

    #[error("Boxed version {0} requires pairwise MACs")]
    PairwiseRequired(BoxedVersion),

    #[error("Pairwise MACs requested with no recipients")]
    NoPairwiseRecipients,

    #[error("Dummy signer not allowed for boxed version {0}")]
    DummySignerNotAllowed(BoxedVersion),

    #[error("Cannot box an empty body")]
    EmptyBody,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// ── Unbox errors ──────────────────────────────────────────────────────────────

/// Why a box could not be opened. Every kind is permanent except
/// `IdentityOracleUnavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnboxErrorKind {
    #[error("Unsupported {kind} version {version} (critical: {critical})")]
    VersionUnsupported {
        kind: VersionKind,
        version: u32,
        critical: bool,
        /// Sender marked the payload critical regardless of our ceiling.
        crit_flag: bool,
    },

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Pairwise MAC invalid")]
    PairwiseAuthInvalid,

    #[error("Message not authenticated for this device")]
    PairwiseAuthMissing,

    #[error("Sender key invalid: {0}")]
    SenderKeyInvalid(String),

    #[error("Sealed sender does not match the outer header")]
    SenderMismatch,

    #[error("Body hash does not match the header")]
    BodyHashInvalid,

    #[error("Required field missing: {field}")]
    HeaderFieldMissing { field: &'static str },

    #[error("Sealed header does not match the outer header: {field}")]
    HeaderMismatch { field: &'static str },

    #[error("Header type {header:?} does not match body type {body:?}")]
    MessageTypeMismatch {
        header: MessageType,
        body: MessageType,
    },

    #[error("Conversation ID does not match the conversation")]
    ConversationMismatch,

    #[error("Ephemeral key missing for unexploded message")]
    EphemeralKeyMissing,

    #[error("Hash chain mismatch at message {id}")]
    ChainMismatch { id: MessageId },

    #[error("Body already seen under message {existing}")]
    IdReplayMismatch { existing: MessageId },

    #[error("Malformed plaintext: {0}")]
    Malformed(String),

    #[error("Identity oracle unavailable: {0}")]
    IdentityOracleUnavailable(String),
}

impl UnboxErrorKind {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::IdentityOracleUnavailable(_))
    }
}

impl From<CryptoError> for UnboxErrorKind {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SignatureVerification => Self::SignatureInvalid,
            _ => Self::DecryptionFailed,
        }
    }
}

impl From<CodecError> for UnboxErrorKind {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedVersion {
                kind,
                version,
                critical,
                crit_flag,
            } => Self::VersionUnsupported {
                kind,
                version,
                critical,
                crit_flag,
            },
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// Error record for a box that did not unbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnboxFailure {
    pub kind: UnboxErrorKind,
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub is_ephemeral: bool,
}

impl UnboxFailure {
    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }

    pub fn is_critical_version(&self) -> bool {
        matches!(self.kind, UnboxErrorKind::VersionUnsupported { critical: true, .. })
    }

    /// Whether a client running with `limits` could parse this message,
    /// e.g. after raising its version ceiling.
    pub fn is_parseable_version(&self, limits: &VersionLimits) -> bool {
        match &self.kind {
            UnboxErrorKind::VersionUnsupported {
                kind,
                version,
                crit_flag,
                ..
            } => !limits.is_critical(*kind, *version, *crit_flag),
            _ => false,
        }
    }
}

// ── Oracle errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    /// The key never belonged to the claimed owner.
    #[error("No such key: {0}")]
    NoKey(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

// ── Configuration errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
