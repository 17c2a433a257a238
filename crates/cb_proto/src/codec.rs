//! Versioned CBOR codec for sealed plaintexts and boxed messages.
//!
//! # Versioned envelope
//! Header and body plaintexts are encoded as
//!
//!   { version: u32, crit: bool, payload: <CBOR value> }
//!
//! The outer map parses for every version, so an unknown `version` is
//! reported with its `crit` flag instead of as a generic parse failure.
//! Known versions above the configured ceiling are rejected the same way;
//! nothing is ever coerced into a different version.

use ciborium::value::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    envelope::{BoxedMessage, SignatureInfo},
    message::{MessageBody, MessageClientHeader},
    version::{VersionKind, VersionLimits},
};

// ── Sealed plaintexts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPlaintextV1 {
    pub client_header: MessageClientHeader,
    /// `EncryptedData::body_hash` of the body ciphertext.
    #[serde(with = "serde_bytes")]
    pub body_hash: Vec<u8>,
    /// v1 only: signature over this header encoded with the field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_signature: Option<SignatureInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderPlaintext {
    V1(HeaderPlaintextV1),
}

impl HeaderPlaintext {
    pub fn version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPlaintextV1 {
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyPlaintextMetaInfo {
    pub crit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPlaintextV2 {
    pub body: MessageBody,
    #[serde(default)]
    pub meta: BodyPlaintextMetaInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPlaintext {
    V1(BodyPlaintextV1),
    V2(BodyPlaintextV2),
}

impl BodyPlaintext {
    pub fn version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
        }
    }

    pub fn body(&self) -> &MessageBody {
        match self {
            Self::V1(b) => &b.body,
            Self::V2(b) => &b.body,
        }
    }

    pub fn into_body(self) -> MessageBody {
        match self {
            Self::V1(b) => b.body,
            Self::V2(b) => b.body,
        }
    }

    /// Wrap `body` in the plaintext version `version` expects.
    pub fn for_version(version: u32, body: MessageBody) -> Result<Self, CodecError> {
        match version {
            1 => Ok(Self::V1(BodyPlaintextV1 { body })),
            2 => Ok(Self::V2(BodyPlaintextV2 {
                body,
                meta: BodyPlaintextMetaInfo::default(),
            })),
            v => Err(CodecError::UnsupportedVersion {
                kind: VersionKind::Body,
                version: v,
                critical: true,
                crit_flag: false,
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Versioned {
    version: u32,
    #[serde(default)]
    crit: bool,
    payload: Value,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unsupported {kind} version {version} (critical: {critical})")]
    UnsupportedVersion {
        kind: VersionKind,
        version: u32,
        critical: bool,
        /// The sender's own `crit` marker, independent of our ceiling.
        crit_flag: bool,
    },
}

// ── Encode / decode ───────────────────────────────────────────────────────────

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
}

fn wrap<T: Serialize>(version: u32, crit: bool, payload: &T) -> Result<Vec<u8>, CodecError> {
    let payload = Value::serialized(payload).map_err(|e| CodecError::Serialization(e.to_string()))?;
    to_cbor(&Versioned {
        version,
        crit,
        payload,
    })
}

fn unwrap_payload<T: DeserializeOwned>(payload: Value) -> Result<T, CodecError> {
    payload
        .deserialized()
        .map_err(|e| CodecError::Deserialization(e.to_string()))
}

fn unsupported(kind: VersionKind, v: &Versioned, limits: &VersionLimits) -> CodecError {
    CodecError::UnsupportedVersion {
        kind,
        version: v.version,
        critical: limits.is_critical(kind, v.version, v.crit),
        crit_flag: v.crit,
    }
}

pub fn encode_header(header: &HeaderPlaintext) -> Result<Vec<u8>, CodecError> {
    match header {
        HeaderPlaintext::V1(h) => wrap(1, false, h),
    }
}

pub fn decode_header(bytes: &[u8], limits: &VersionLimits) -> Result<HeaderPlaintext, CodecError> {
    let v: Versioned = from_cbor(bytes)?;
    if v.version > limits.max_header_version {
        return Err(unsupported(VersionKind::Header, &v, limits));
    }
    match v.version {
        1 => Ok(HeaderPlaintext::V1(unwrap_payload(v.payload)?)),
        _ => Err(unsupported(VersionKind::Header, &v, limits)),
    }
}

pub fn encode_body(body: &BodyPlaintext) -> Result<Vec<u8>, CodecError> {
    match body {
        BodyPlaintext::V1(b) => wrap(1, false, b),
        BodyPlaintext::V2(b) => wrap(2, b.meta.crit, b),
    }
}

pub fn decode_body(bytes: &[u8], limits: &VersionLimits) -> Result<BodyPlaintext, CodecError> {
    let v: Versioned = from_cbor(bytes)?;
    if v.version > limits.max_body_version {
        return Err(unsupported(VersionKind::Body, &v, limits));
    }
    match v.version {
        1 => Ok(BodyPlaintext::V1(unwrap_payload(v.payload)?)),
        2 => Ok(BodyPlaintext::V2(unwrap_payload(v.payload)?)),
        _ => Err(unsupported(VersionKind::Body, &v, limits)),
    }
}

/// Test and migration hook: encode an arbitrary payload under any version
/// number, e.g. to exercise the unknown-version path.
pub fn encode_versioned<T: Serialize>(version: u32, crit: bool, payload: &T) -> Result<Vec<u8>, CodecError> {
    wrap(version, crit, payload)
}

pub fn encode_boxed(boxed: &BoxedMessage) -> Result<Vec<u8>, CodecError> {
    to_cbor(boxed)
}

pub fn decode_boxed(bytes: &[u8]) -> Result<BoxedMessage, CodecError> {
    from_cbor(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        ConversationIdTriple, DeviceId, MessageType, TopicType, UserId,
    };

    fn header() -> HeaderPlaintext {
        HeaderPlaintext::V1(HeaderPlaintextV1 {
            client_header: MessageClientHeader {
                conv: ConversationIdTriple {
                    tlf_id: vec![1, 2, 3],
                    topic_type: TopicType::Chat,
                    topic_id: vec![4, 5],
                },
                tlf_name: "alice,bob".into(),
                tlf_public: false,
                message_type: MessageType::Text,
                supersedes: None,
                deletes: vec![],
                prev: vec![],
                delete_history: None,
                sender: UserId("alice".into()),
                sender_device: DeviceId("phone".into()),
                merkle_root: None,
                outbox_id: None,
                outbox_info: None,
                ephemeral_metadata: None,
            },
            body_hash: vec![9; 32],
            header_signature: None,
        })
    }

    #[test]
    fn header_and_body_decode_to_same_version() {
        let limits = VersionLimits::default();
        let h = header();
        assert_eq!(decode_header(&encode_header(&h).unwrap(), &limits).unwrap(), h);

        let b = BodyPlaintext::for_version(2, MessageBody::Text { body: "hi".into() }).unwrap();
        let decoded = decode_body(&encode_body(&b).unwrap(), &limits).unwrap();
        assert_eq!(decoded.version(), 2);
        assert_eq!(decoded, b);
    }

    #[test]
    fn unknown_version_below_ceiling_is_not_critical() {
        let mut limits = VersionLimits::default();
        limits.max_body_version = 9;
        let bytes = encode_versioned(7, false, &BodyPlaintextV1 { body: MessageBody::Join }).unwrap();
        match decode_body(&bytes, &limits) {
            Err(CodecError::UnsupportedVersion { kind, version, critical, .. }) => {
                assert_eq!(kind, VersionKind::Body);
                assert_eq!(version, 7);
                assert!(!critical);
            }
            other => panic!("expected unsupported version, got {other:?}"),
        }
    }

    #[test]
    fn crit_flag_makes_unknown_version_critical() {
        let mut limits = VersionLimits::default();
        limits.max_body_version = 9;
        let bytes = encode_versioned(7, true, &BodyPlaintextV1 { body: MessageBody::Join }).unwrap();
        assert!(matches!(
            decode_body(&bytes, &limits),
            Err(CodecError::UnsupportedVersion { critical: true, .. })
        ));
    }

    #[test]
    fn known_version_above_ceiling_is_critical() {
        let limits = VersionLimits {
            max_body_version: 1,
            ..VersionLimits::default()
        };
        let b = BodyPlaintext::for_version(2, MessageBody::Leave).unwrap();
        assert!(matches!(
            decode_body(&encode_body(&b).unwrap(), &limits),
            Err(CodecError::UnsupportedVersion { version: 2, critical: true, .. })
        ));
    }

    #[test]
    fn garbage_is_a_deserialization_error() {
        assert!(matches!(
            decode_header(b"\xff\x00garbage", &VersionLimits::default()),
            Err(CodecError::Deserialization(_))
        ));
    }
}
