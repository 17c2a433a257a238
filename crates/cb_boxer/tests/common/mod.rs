//! Shared fixtures: an in-memory key oracle and a two-party harness
//! (alice sends, this device belongs to bob).

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use cb_boxer::{
    BoxArgs, Boxer, BoxerConfig, ConversationInfo, KeyOracle, MemoryChainStore, OracleError,
    PairwiseArgs, SenderDisplay, UnboxErrorKind, UnboxKeys, UnboxMode, UnboxedMessage, UserVersion,
    ValidMessage,
};
use cb_crypto::{ConversationKey, DhKeyPair, DhPublicKey, KeyId, SigningKeyPair};
use cb_proto::{
    message::{ConversationIdTriple, DeviceId, MessageBody, MessageType, TopicType, UserId},
    BoxedMessage, MessageClientHeader, MessageId, PlaintextMessage, ServerHeader,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn alice() -> UserId {
    UserId("alice".into())
}

pub fn bob() -> UserId {
    UserId("bob".into())
}

// ── Mock oracle ───────────────────────────────────────────────────────────────

struct KeyRecord {
    owner: UserId,
    revoked_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MockOracle {
    keys: Mutex<HashMap<KeyId, KeyRecord>>,
    device_keys: Mutex<HashMap<UserId, Vec<DhPublicKey>>>,
    offline: AtomicBool,
}

impl MockOracle {
    pub fn register(&self, owner: &UserId, key_id: KeyId) {
        self.keys.lock().insert(
            key_id,
            KeyRecord {
                owner: owner.clone(),
                revoked_at: None,
            },
        );
    }

    pub fn revoke(&self, key_id: &KeyId, at: DateTime<Utc>) {
        if let Some(record) = self.keys.lock().get_mut(key_id) {
            record.revoked_at = Some(at);
        }
    }

    pub fn add_device_key(&self, owner: &UserId, key: DhPublicKey) {
        self.device_keys.lock().entry(owner.clone()).or_default().push(key);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyOracle for MockOracle {
    async fn valid_sender_key(
        &self,
        sender: &UserId,
        key_id: &KeyId,
        ctime: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, OracleError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("identity server offline".into()));
        }
        let keys = self.keys.lock();
        let record = keys
            .get(key_id)
            .ok_or_else(|| OracleError::NoKey(format!("unknown key {key_id}")))?;
        if &record.owner != sender {
            return Err(OracleError::NoKey("key belongs to another user".into()));
        }
        match record.revoked_at {
            Some(revoked) if revoked <= ctime => {
                Err(OracleError::NoKey("key revoked before message".into()))
            }
            other => Ok(other),
        }
    }

    async fn batch_load_encryption_keys(
        &self,
        users: &[UserVersion],
    ) -> Result<Vec<DhPublicKey>, OracleError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("identity server offline".into()));
        }
        let device_keys = self.device_keys.lock();
        Ok(users
            .iter()
            .flat_map(|u| device_keys.get(&u.uid).cloned().unwrap_or_default())
            .collect())
    }

    async fn sender_display(
        &self,
        sender: &UserId,
        device: &DeviceId,
    ) -> Result<SenderDisplay, OracleError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("identity server offline".into()));
        }
        Ok(SenderDisplay {
            username: sender.0.clone(),
            device_name: device.0.clone(),
            device_type: "desktop".into(),
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub boxer: Boxer,
    pub oracle: Arc<MockOracle>,
    pub key: ConversationKey,
    pub signer: SigningKeyPair,
    /// Alice's device DH key (pairwise sender).
    pub sender_dh: DhKeyPair,
    /// Bob's device DH key (this device).
    pub device: DhKeyPair,
    pub recipients: Vec<DhPublicKey>,
    pub triple: ConversationIdTriple,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BoxerConfig::default())
    }

    pub fn with_config(config: BoxerConfig) -> Self {
        init_tracing();
        let oracle = Arc::new(MockOracle::default());
        let signer = SigningKeyPair::generate();
        let sender_dh = DhKeyPair::generate();
        let device = DhKeyPair::generate();

        oracle.register(&alice(), signer.key_id());
        oracle.register(&alice(), sender_dh.key_id());
        oracle.add_device_key(&alice(), sender_dh.public);
        oracle.add_device_key(&bob(), device.public);

        let boxer = Boxer::new(config, oracle.clone(), Arc::new(MemoryChainStore::new())).unwrap();
        let recipients = vec![device.public, sender_dh.public];

        Self {
            boxer,
            oracle,
            key: ConversationKey::generate(1),
            signer,
            sender_dh,
            device,
            recipients,
            triple: ConversationIdTriple {
                tlf_id: b"alice,bob".to_vec(),
                topic_type: TopicType::Chat,
                topic_id: b"general".to_vec(),
            },
        }
    }

    /// Another boxer sharing the oracle but with an empty chain store.
    pub fn fresh_boxer(&self, config: BoxerConfig) -> Boxer {
        Boxer::new(config, self.oracle.clone(), Arc::new(MemoryChainStore::new())).unwrap()
    }

    pub fn conv(&self) -> ConversationInfo {
        ConversationInfo::from_triple(&self.triple)
    }

    pub fn header(&self, message_type: MessageType) -> MessageClientHeader {
        MessageClientHeader {
            conv: self.triple.clone(),
            tlf_name: "alice,bob".into(),
            tlf_public: false,
            message_type,
            supersedes: None,
            deletes: vec![],
            prev: vec![],
            delete_history: None,
            sender: alice(),
            sender_device: DeviceId("alice-laptop".into()),
            merkle_root: None,
            outbox_id: None,
            outbox_info: None,
            ephemeral_metadata: None,
        }
    }

    pub fn text(&self, body: &str) -> PlaintextMessage {
        PlaintextMessage {
            client_header: self.header(MessageType::Text),
            body: MessageBody::Text { body: body.into() },
        }
    }

    pub fn pairwise(&self) -> PairwiseArgs<'_> {
        PairwiseArgs {
            sender: &self.sender_dh,
            recipients: &self.recipients,
        }
    }

    /// Pairwise MACs are attached for v4, where they are mandatory.
    pub fn args(&self, version: u32) -> BoxArgs<'_> {
        BoxArgs {
            key: &self.key,
            ephemeral_key: None,
            signing_key: &self.signer,
            version: Some(version),
            pairwise: (version >= 4).then(|| self.pairwise()),
        }
    }

    pub fn keys(&self) -> UnboxKeys<'_> {
        UnboxKeys {
            key: &self.key,
            ephemeral_key: None,
            device_key: Some(&self.device),
        }
    }

    /// Box and attach a server header stamped now.
    pub fn seal(&self, msg: &PlaintextMessage, version: u32, id: u32) -> BoxedMessage {
        let mut boxed = self.boxer.box_message(msg, self.args(version)).unwrap();
        stamp(&mut boxed, id, Utc::now());
        boxed
    }

    pub async fn open(&self, boxed: &BoxedMessage) -> UnboxedMessage {
        self.boxer.unbox_message(boxed, &self.conv(), self.keys()).await
    }

    pub async fn open_with(&self, boxer: &Boxer, boxed: &BoxedMessage) -> UnboxedMessage {
        boxer.unbox_message(boxed, &self.conv(), self.keys()).await
    }

    pub async fn open_quick(&self, boxed: &BoxedMessage) -> UnboxedMessage {
        self.boxer
            .unbox_message_with_mode(boxed, &self.conv(), self.keys(), UnboxMode::Quick)
            .await
    }

    /// Unbox as a member of another conversation sharing this boxer.
    pub async fn open_in(&self, triple: &ConversationIdTriple, boxed: &BoxedMessage) -> UnboxedMessage {
        self.boxer
            .unbox_message(boxed, &ConversationInfo::from_triple(triple), self.keys())
            .await
    }

    pub fn message(&self, client_header: MessageClientHeader, body: MessageBody) -> PlaintextMessage {
        PlaintextMessage { client_header, body }
    }
}

pub fn stamp(boxed: &mut BoxedMessage, id: u32, ctime: DateTime<Utc>) {
    boxed.server_header = Some(ServerHeader {
        message_id: MessageId(id),
        ctime,
        superseded_by: None,
    });
}

pub fn expect_valid(m: UnboxedMessage) -> ValidMessage {
    match m {
        UnboxedMessage::Valid(v) => v,
        other => panic!("expected a valid message, got {other:?}"),
    }
}

pub fn expect_permanent(m: UnboxedMessage) -> UnboxErrorKind {
    match m {
        UnboxedMessage::PermanentError(f) => f.kind,
        other => panic!("expected a permanent error, got {other:?}"),
    }
}

pub fn text_of(v: &ValidMessage) -> &str {
    match &v.body {
        MessageBody::Text { body } => body,
        other => panic!("expected a text body, got {other:?}"),
    }
}
