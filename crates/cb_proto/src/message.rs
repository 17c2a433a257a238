//! Plaintext message types (what the boxer seals).

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cb_crypto::hash::derive_id;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Server-assigned, per-conversation message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

/// Client-chosen correlation ID for a pending send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxId(#[serde(with = "serde_bytes")] pub Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    Chat,
    Dev,
    Wallet,
}

impl TopicType {
    fn as_byte(self) -> u8 {
        match self {
            Self::Chat => 1,
            Self::Dev => 2,
            Self::Wallet => 3,
        }
    }
}

/// The three values a conversation is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationIdTriple {
    #[serde(with = "serde_bytes")]
    pub tlf_id: Vec<u8>,
    pub topic_type: TopicType,
    #[serde(with = "serde_bytes")]
    pub topic_id: Vec<u8>,
}

impl ConversationIdTriple {
    pub fn to_conversation_id(&self) -> ConversationId {
        ConversationId(derive_id(
            "cb-conversation-id-v1",
            &[&self.tlf_id, &[self.topic_type.as_byte()], &self.topic_id],
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub [u8; 32]);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({})", hex::encode(&self.0[..8]))
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Edit,
    Delete,
    DeleteHistory,
    Reaction,
    Headline,
    Metadata,
    Join,
    Leave,
}

/// `(message id, header hash)` asserted by a later message about an
/// earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreviousPointer {
    pub id: MessageId,
    #[serde(with = "serde_bytes")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxInfo {
    pub prev: MessageId,
    pub compose_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRoot {
    pub seqno: u64,
    #[serde(with = "serde_bytes")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteHistory {
    pub up_to: MessageId,
}

/// Self-destruct parameters. `generation` names the ephemeral key the body
/// was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMetadata {
    pub lifetime_secs: u64,
    pub generation: u32,
}

impl EphemeralMetadata {
    /// `None` if the lifetime does not fit a `Duration`.
    pub fn lifetime(&self) -> Option<Duration> {
        i64::try_from(self.lifetime_secs)
            .ok()
            .and_then(Duration::try_seconds)
    }

    /// True once `ctime + lifetime` is in the past relative to `now`.
    pub fn is_exploded(&self, ctime: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.lifetime()
            .and_then(|lifetime| ctime.checked_add_signed(lifetime))
            .is_some_and(|expiry| expiry < now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageClientHeader {
    pub conv: ConversationIdTriple,
    pub tlf_name: String,
    pub tlf_public: bool,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev: Vec<PreviousPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_history: Option<DeleteHistory>,
    pub sender: UserId,
    pub sender_device: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<MerkleRoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<OutboxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_info: Option<OutboxInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_metadata: Option<EphemeralMetadata>,
}

// ── Body ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    Edit {
        message_id: MessageId,
        body: String,
    },
    Delete {
        message_ids: Vec<MessageId>,
    },
    DeleteHistory {
        up_to: MessageId,
    },
    Reaction {
        message_id: MessageId,
        body: String,
    },
    Headline {
        headline: String,
    },
    Metadata {
        conversation_title: String,
    },
    Join,
    Leave,
    /// Body was deleted server-side or has exploded; nothing to decrypt.
    Empty,
}

impl MessageBody {
    /// `None` for `Empty`, which only stands in for a deleted or exploded
    /// body and is never sealed.
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Self::Text { .. } => MessageType::Text,
            Self::Edit { .. } => MessageType::Edit,
            Self::Delete { .. } => MessageType::Delete,
            Self::DeleteHistory { .. } => MessageType::DeleteHistory,
            Self::Reaction { .. } => MessageType::Reaction,
            Self::Headline { .. } => MessageType::Headline,
            Self::Metadata { .. } => MessageType::Metadata,
            Self::Join => MessageType::Join,
            Self::Leave => MessageType::Leave,
            Self::Empty => return None,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// What the caller hands to the boxer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextMessage {
    pub client_header: MessageClientHeader,
    pub body: MessageBody,
}
