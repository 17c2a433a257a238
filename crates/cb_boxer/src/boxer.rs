//! Boxer / unboxer orchestrator.
//!
//! Box:   encode body → seal body → commit body hash into header → (v1: sign
//!        header) → seal header → attach pairwise MACs.
//!
//! Unbox: server header → version gate → conversation binding → key
//!        generation / ephemeral key → pairwise MAC → open + decode header →
//!        open + decode body → outer/sealed header comparison → message type
//!        → sender key validity → body hash → message-ID binding → hash chain.
//!
//! Quick mode defers the sender key check, so it only verifies the bindings
//! against the chain store; `resolve` records them once the key checks out.
//!
//! Every unbox failure becomes an `UnboxedMessage` error state; nothing is
//! returned as `Err` past this boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use cb_crypto::{
    aead, hash::ct_eq, pairwise, signencrypt, ConversationKey, DhKeyPair, DhPublicKey,
    EphemeralKey, KeyId, SigningKeyPair, VerifyKey,
};
use cb_proto::{
    codec::{self, HeaderPlaintextV1},
    BodyPlaintext, BoxedMessage, BoxedVersion, ConversationId, ConversationIdTriple,
    EncryptedData, HeaderPlaintext, MessageBody, MessageClientHeader, MessageId, PairwiseMacs,
    PlaintextMessage, PreviousPointer, ServerHeader, SignatureInfo, VersionKind,
};

use crate::{
    chain::{record_chain, record_replay, verify_chain, verify_replay, ChainStore},
    config::{BoxerConfig, UnboxMode},
    error::{BoxingError, ConfigError, UnboxErrorKind, UnboxFailure},
    oracle::{self, KeyOracle, SenderDisplay, UserVersion},
};

const HEADER_SIGNATURE_PREFIX: &[u8] = b"cb-chat-header-v1";

// ── Arguments ─────────────────────────────────────────────────────────────────

pub struct PairwiseArgs<'a> {
    /// Sender's device DH key for this message.
    pub sender: &'a DhKeyPair,
    pub recipients: &'a [DhPublicKey],
}

pub struct BoxArgs<'a> {
    pub key: &'a ConversationKey,
    pub ephemeral_key: Option<&'a EphemeralKey>,
    pub signing_key: &'a SigningKeyPair,
    /// `None` uses the configured default.
    pub version: Option<u32>,
    pub pairwise: Option<PairwiseArgs<'a>>,
}

pub struct UnboxKeys<'a> {
    pub key: &'a ConversationKey,
    pub ephemeral_key: Option<&'a EphemeralKey>,
    /// This device's DH key; required to check pairwise MACs.
    pub device_key: Option<&'a DhKeyPair>,
}

/// The conversation a box was fetched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInfo {
    pub id: ConversationId,
}

impl ConversationInfo {
    pub fn from_triple(triple: &ConversationIdTriple) -> Self {
        Self {
            id: triple.to_conversation_id(),
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Verified,
    /// Unboxed in quick mode; the sender key has not been checked yet.
    Provisional,
}

#[derive(Debug, Clone)]
pub struct ValidMessage {
    pub server_header: ServerHeader,
    /// The sealed (verified) client header.
    pub client_header: MessageClientHeader,
    pub body: MessageBody,
    pub boxed_version: BoxedVersion,
    pub sender_display: SenderDisplay,
    pub header_hash: [u8; 32],
    pub body_hash: Vec<u8>,
    pub verify_key: VerifyKey,
    /// v1 only.
    pub header_signature: Option<SignatureInfo>,
    /// The key the validity gate checks: the verify key, or the pairwise
    /// sender DH key for dummy-signed v4 boxes.
    pub sender_key_id: KeyId,
    pub sender_device_revoked_at: Option<DateTime<Utc>>,
    pub key_status: KeyStatus,
    pub has_pairwise_macs: bool,
    pub exploded: bool,
}

impl ValidMessage {
    pub fn message_id(&self) -> MessageId {
        self.server_header.message_id
    }

    pub fn is_ephemeral(&self) -> bool {
        self.client_header.ephemeral_metadata.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum UnboxedMessage {
    Valid(ValidMessage),
    PermanentError(UnboxFailure),
    TransientError(UnboxFailure),
}

impl UnboxedMessage {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn valid(&self) -> Option<&ValidMessage> {
        match self {
            Self::Valid(m) => Some(m),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&UnboxFailure> {
        match self {
            Self::PermanentError(f) | Self::TransientError(f) => Some(f),
            Self::Valid(_) => None,
        }
    }

    pub fn error_kind(&self) -> Option<&UnboxErrorKind> {
        self.failure().map(|f| &f.kind)
    }
}

/// Output of [`Boxer::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub message: UnboxedMessage,
    pub modified: bool,
}

// ── Boxer ─────────────────────────────────────────────────────────────────────

pub struct Boxer {
    config: BoxerConfig,
    oracle: Arc<dyn KeyOracle>,
    store: Arc<dyn ChainStore>,
}

impl Boxer {
    pub fn new(
        config: BoxerConfig,
        oracle: Arc<dyn KeyOracle>,
        store: Arc<dyn ChainStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            oracle,
            store,
        })
    }

    pub fn config(&self) -> &BoxerConfig {
        &self.config
    }

    // ── Box ───────────────────────────────────────────────────────────────

    pub fn box_message(
        &self,
        msg: &PlaintextMessage,
        args: BoxArgs<'_>,
    ) -> Result<BoxedMessage, BoxingError> {
        // `Empty` only ever comes out of an unbox.
        if msg.body.is_empty() {
            return Err(BoxingError::EmptyBody);
        }
        self.seal_message(msg, args)
    }

    fn seal_message(
        &self,
        msg: &PlaintextMessage,
        args: BoxArgs<'_>,
    ) -> Result<BoxedMessage, BoxingError> {
        let version = self.boxing_version(args.version)?;
        let header = &msg.client_header;
        let signer = args.signing_key;

        let body_key = match (&header.ephemeral_metadata, args.ephemeral_key) {
            (Some(_), _) if !version.allows_ephemeral() => {
                return Err(BoxingError::EphemeralNotSupported(version))
            }
            (Some(meta), Some(ek)) => {
                if ek.generation() != meta.generation {
                    return Err(BoxingError::EphemeralKeyMismatch(format!(
                        "metadata names generation {}, key is generation {}",
                        meta.generation,
                        ek.generation()
                    )));
                }
                ek.as_bytes()
            }
            (Some(_), None) => {
                return Err(BoxingError::EphemeralKeyMismatch(
                    "ephemeral metadata without an ephemeral key".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(BoxingError::EphemeralKeyMismatch(
                    "ephemeral key supplied for a non-ephemeral message".into(),
                ))
            }
            (None, None) => args.key.as_bytes(),
        };

        match &args.pairwise {
            Some(_) if !version.allows_pairwise() => {
                return Err(BoxingError::PairwiseNotSupported(version))
            }
            Some(p) if p.recipients.is_empty() => return Err(BoxingError::NoPairwiseRecipients),
            None if version.requires_pairwise() => return Err(BoxingError::PairwiseRequired(version)),
            _ => {}
        }

        if signer.public.is_dummy() && !version.allows_dummy_signer() {
            return Err(BoxingError::DummySignerNotAllowed(version));
        }

        let body_pt = BodyPlaintext::for_version(version.body_version(), msg.body.clone())?;
        let body_bytes = Zeroizing::new(codec::encode_body(&body_pt)?);
        let body_ciphertext = self.seal(version, &body_bytes, body_key, signer)?;

        let mut header_pt = HeaderPlaintextV1 {
            client_header: header.clone(),
            body_hash: body_ciphertext.body_hash().to_vec(),
            header_signature: None,
        };
        if version == BoxedVersion::V1 {
            let unsigned = codec::encode_header(&HeaderPlaintext::V1(header_pt.clone()))?;
            header_pt.header_signature = Some(SignatureInfo {
                v: 1,
                s: signer.sign(HEADER_SIGNATURE_PREFIX, &unsigned).to_vec(),
                k: signer.public.as_bytes().to_vec(),
            });
        }
        let header_bytes = Zeroizing::new(codec::encode_header(&HeaderPlaintext::V1(header_pt))?);
        let header_ciphertext = self.seal(version, &header_bytes, args.key.as_bytes(), signer)?;

        let pairwise = match args.pairwise {
            Some(p) => {
                let input = pairwise::mac_input(&header_ciphertext.n, &header_ciphertext.e);
                let macs = pairwise::make_macs(p.sender, p.recipients, &input)?
                    .into_iter()
                    .map(|(key_id, tag)| (key_id, ByteBuf::from(tag.to_vec())))
                    .collect();
                Some(PairwiseMacs {
                    sender_key: p.sender.public,
                    macs,
                })
            }
            None => None,
        };

        debug!(
            version = %version,
            msg_type = ?header.message_type,
            pairwise = pairwise.is_some(),
            "message boxed"
        );

        Ok(BoxedMessage {
            version: version.as_u32(),
            client_header: header.clone(),
            header_ciphertext,
            body_ciphertext,
            verify_key: if version.uses_signencrypt() {
                signer.public.as_bytes().to_vec()
            } else {
                Vec::new()
            },
            key_generation: args.key.generation(),
            pairwise,
            server_header: None,
        })
    }

    fn boxing_version(&self, requested: Option<u32>) -> Result<BoxedVersion, BoxingError> {
        let raw = requested.unwrap_or(self.config.default_boxed_version);
        let version = BoxedVersion::from_wire(raw).ok_or(BoxingError::UnsupportedVersion(raw))?;
        let max = self.config.limits.max_boxed_version;
        if version.as_u32() > max {
            return Err(BoxingError::VersionAboveMax {
                version: version.as_u32(),
                max,
            });
        }
        Ok(version)
    }

    fn seal(
        &self,
        version: BoxedVersion,
        plaintext: &[u8],
        key: &[u8; 32],
        signer: &SigningKeyPair,
    ) -> Result<EncryptedData, BoxingError> {
        if version.uses_signencrypt() {
            let sealed = signencrypt::seal(plaintext, key, signer, self.config.signcrypt_chunk_size)?;
            Ok(EncryptedData {
                v: version.as_u32(),
                e: sealed.ciphertext,
                n: sealed.nonce_prefix.to_vec(),
            })
        } else {
            let nonce = aead::generate_nonce();
            Ok(EncryptedData {
                v: version.as_u32(),
                e: aead::seal(key, &nonce, plaintext, &[])?,
                n: nonce.to_vec(),
            })
        }
    }

    // ── Unbox ─────────────────────────────────────────────────────────────

    /// Unbox with the configured mode.
    pub async fn unbox_message(
        &self,
        boxed: &BoxedMessage,
        conv: &ConversationInfo,
        keys: UnboxKeys<'_>,
    ) -> UnboxedMessage {
        self.unbox_message_with_mode(boxed, conv, keys, self.config.unbox_mode)
            .await
    }

    pub async fn unbox_message_with_mode(
        &self,
        boxed: &BoxedMessage,
        conv: &ConversationInfo,
        keys: UnboxKeys<'_>,
        mode: UnboxMode,
    ) -> UnboxedMessage {
        let message_id = boxed.message_id().unwrap_or(MessageId(0));
        match self.unbox_inner(boxed, conv, keys, mode).await {
            Ok(valid) => {
                debug!(
                    msg_id = %message_id,
                    version = %valid.boxed_version,
                    provisional = valid.key_status == KeyStatus::Provisional,
                    exploded = valid.exploded,
                    "message unboxed"
                );
                UnboxedMessage::Valid(valid)
            }
            Err(kind) => {
                let failure = UnboxFailure {
                    kind,
                    message_id,
                    message_type: boxed.client_header.message_type,
                    is_ephemeral: boxed.client_header.ephemeral_metadata.is_some(),
                };
                if failure.is_permanent() {
                    warn!(msg_id = %message_id, error = %failure.kind, "unbox failed permanently");
                    UnboxedMessage::PermanentError(failure)
                } else {
                    warn!(msg_id = %message_id, error = %failure.kind, "unbox failed, retryable");
                    UnboxedMessage::TransientError(failure)
                }
            }
        }
    }

    async fn unbox_inner(
        &self,
        boxed: &BoxedMessage,
        conv: &ConversationInfo,
        keys: UnboxKeys<'_>,
        mode: UnboxMode,
    ) -> Result<ValidMessage, UnboxErrorKind> {
        let limits = &self.config.limits;
        let server_header = boxed
            .server_header
            .as_ref()
            .ok_or(UnboxErrorKind::HeaderFieldMissing {
                field: "server_header",
            })?;

        let version = self.unboxing_version(boxed.version)?;

        if boxed.client_header.conv.to_conversation_id() != conv.id {
            return Err(UnboxErrorKind::ConversationMismatch);
        }
        if boxed.key_generation != keys.key.generation() {
            return Err(UnboxErrorKind::DecryptionFailed);
        }

        // Ephemeral messages past their lifetime unbox without the body key.
        let ephemeral = boxed.client_header.ephemeral_metadata.as_ref();
        if ephemeral.is_some() && !version.allows_ephemeral() {
            return Err(UnboxErrorKind::Malformed(format!(
                "ephemeral metadata on a {version} box"
            )));
        }
        let exploded = ephemeral.is_some_and(|m| m.is_exploded(server_header.ctime, Utc::now()));
        let body_key = match ephemeral {
            None => Some(keys.key.as_bytes()),
            Some(_) if exploded => None,
            Some(meta) => match keys.ephemeral_key {
                None => return Err(UnboxErrorKind::EphemeralKeyMissing),
                Some(ek) if ek.generation() != meta.generation => {
                    return Err(UnboxErrorKind::DecryptionFailed)
                }
                Some(ek) => Some(ek.as_bytes()),
            },
        };

        self.verify_pairwise(boxed, version, keys.device_key)?;

        // ── Header ──
        let (header, verify_key) = self.open_header(boxed, version, keys.key)?;
        if verify_key.is_dummy() && !(version.allows_dummy_signer() && boxed.pairwise.is_some()) {
            return Err(UnboxErrorKind::SignatureInvalid);
        }

        // ── Body ──
        let body_deleted = boxed.body_ciphertext.is_deleted();
        let body = match body_key {
            _ if body_deleted => {
                if server_header.superseded_by.is_none() {
                    debug!(msg_id = %server_header.message_id, "deleted body without superseded_by");
                }
                MessageBody::Empty
            }
            None => MessageBody::Empty,
            Some(key) => {
                let bytes = open(version, &boxed.body_ciphertext, key, Some(&verify_key))?;
                codec::decode_body(&bytes, limits)?.into_body()
            }
        };

        compare_headers(&header.client_header, &boxed.client_header)?;

        if !body_deleted && !exploded {
            match body.message_type() {
                Some(body_type) if body_type == header.client_header.message_type => {}
                Some(body_type) => {
                    return Err(UnboxErrorKind::MessageTypeMismatch {
                        header: header.client_header.message_type,
                        body: body_type,
                    })
                }
                None => return Err(UnboxErrorKind::Malformed("sealed body carries no content".into())),
            }
        }

        // ── Sender key ──
        let sender_key_id = match (&boxed.pairwise, verify_key.is_dummy()) {
            (Some(pw), true) => pw.sender_key.key_id(),
            _ => verify_key.key_id(),
        };
        let (key_status, revoked_at, sender_display) = match mode {
            UnboxMode::Quick => (KeyStatus::Provisional, None, SenderDisplay::default()),
            UnboxMode::Full => {
                let revoked_at = oracle::check_sender_key(
                    self.oracle.as_ref(),
                    self.config.oracle_timeout(),
                    &header.client_header.sender,
                    &sender_key_id,
                    server_header.ctime,
                )
                .await?;
                let display = oracle::lookup_display(
                    self.oracle.as_ref(),
                    self.config.oracle_timeout(),
                    &header.client_header.sender,
                    &header.client_header.sender_device,
                )
                .await;
                (KeyStatus::Verified, revoked_at, display)
            }
        };

        // ── Bindings ──
        if !body_deleted && !ct_eq(&boxed.body_ciphertext.body_hash(), &header.body_hash) {
            return Err(UnboxErrorKind::BodyHashInvalid);
        }
        let header_hash = boxed.header_hash();
        let bindings = Bindings {
            conv: &conv.id,
            id: server_header.message_id,
            body_hash: &header.body_hash,
            header_hash: &header_hash,
            prevs: &header.client_header.prev,
        };
        match key_status {
            KeyStatus::Verified => bindings.record(self.store.as_ref())?,
            KeyStatus::Provisional => bindings.verify(self.store.as_ref())?,
        }

        Ok(ValidMessage {
            server_header: server_header.clone(),
            client_header: header.client_header,
            body,
            boxed_version: version,
            sender_display,
            header_hash,
            body_hash: header.body_hash,
            verify_key,
            header_signature: header.header_signature,
            sender_key_id,
            sender_device_revoked_at: revoked_at,
            key_status,
            has_pairwise_macs: boxed.pairwise.is_some(),
            exploded,
        })
    }

    fn unboxing_version(&self, raw: u32) -> Result<BoxedVersion, UnboxErrorKind> {
        let unsupported = |critical| UnboxErrorKind::VersionUnsupported {
            kind: VersionKind::Boxed,
            version: raw,
            critical,
            crit_flag: false,
        };
        if raw > self.config.limits.max_boxed_version {
            return Err(unsupported(true));
        }
        BoxedVersion::from_wire(raw).ok_or_else(|| unsupported(false))
    }

    fn verify_pairwise(
        &self,
        boxed: &BoxedMessage,
        version: BoxedVersion,
        device_key: Option<&DhKeyPair>,
    ) -> Result<(), UnboxErrorKind> {
        let Some(pw) = &boxed.pairwise else {
            if version.requires_pairwise() {
                return Err(UnboxErrorKind::PairwiseAuthMissing);
            }
            return Ok(());
        };
        if !version.allows_pairwise() {
            return Err(UnboxErrorKind::Malformed(format!(
                "pairwise MACs on a {version} box"
            )));
        }
        let device = device_key.ok_or(UnboxErrorKind::PairwiseAuthMissing)?;
        let tag = pw
            .macs
            .get(&device.key_id())
            .ok_or(UnboxErrorKind::PairwiseAuthMissing)?;
        let input = pairwise::mac_input(&boxed.header_ciphertext.n, &boxed.header_ciphertext.e);
        if !pairwise::verify_mac(device, &pw.sender_key, &input, tag)? {
            return Err(UnboxErrorKind::PairwiseAuthInvalid);
        }
        Ok(())
    }

    fn open_header(
        &self,
        boxed: &BoxedMessage,
        version: BoxedVersion,
        key: &ConversationKey,
    ) -> Result<(HeaderPlaintextV1, VerifyKey), UnboxErrorKind> {
        let limits = &self.config.limits;
        if version.uses_signencrypt() {
            let verify_key =
                VerifyKey::from_bytes(&boxed.verify_key).map_err(|_| UnboxErrorKind::SignatureInvalid)?;
            let bytes = open(version, &boxed.header_ciphertext, key.as_bytes(), Some(&verify_key))?;
            let HeaderPlaintext::V1(header) = codec::decode_header(&bytes, limits)?;
            return Ok((header, verify_key));
        }

        let bytes = open(version, &boxed.header_ciphertext, key.as_bytes(), None)?;
        let HeaderPlaintext::V1(mut header) = codec::decode_header(&bytes, limits)?;
        let sig = header
            .header_signature
            .take()
            .ok_or(UnboxErrorKind::SignatureInvalid)?;
        let unsigned = codec::encode_header(&HeaderPlaintext::V1(header.clone()))
            .map_err(|e| UnboxErrorKind::Malformed(e.to_string()))?;
        let verify_key = VerifyKey::from_bytes(&sig.k).map_err(|_| UnboxErrorKind::SignatureInvalid)?;
        verify_key.verify(HEADER_SIGNATURE_PREFIX, &unsigned, &sig.s)?;
        header.header_signature = Some(sig);
        Ok((header, verify_key))
    }

    // ── Resolve ───────────────────────────────────────────────────────────

    /// Finish a quick-mode unbox: run the deferred sender-key check and fill
    /// in the sender display. Messages that are already final pass through.
    pub async fn resolve(&self, message: UnboxedMessage) -> Resolved {
        let mut valid = match message {
            UnboxedMessage::Valid(m) if m.key_status == KeyStatus::Provisional => m,
            UnboxedMessage::Valid(mut m) if m.sender_display.is_empty() => {
                m.sender_display = self.display_for(&m).await;
                let modified = !m.sender_display.is_empty();
                return Resolved {
                    message: UnboxedMessage::Valid(m),
                    modified,
                };
            }
            other => {
                return Resolved {
                    message: other,
                    modified: false,
                }
            }
        };

        let msg_id = valid.message_id();
        let checked = oracle::check_sender_key(
            self.oracle.as_ref(),
            self.config.oracle_timeout(),
            &valid.client_header.sender,
            &valid.sender_key_id,
            valid.server_header.ctime,
        )
        .await
        .and_then(|revoked_at| {
            let conv = valid.client_header.conv.to_conversation_id();
            Bindings {
                conv: &conv,
                id: msg_id,
                body_hash: &valid.body_hash,
                header_hash: &valid.header_hash,
                prevs: &valid.client_header.prev,
            }
            .record(self.store.as_ref())?;
            Ok(revoked_at)
        });
        match checked {
            Ok(revoked_at) => {
                info!(msg_id = %msg_id, revoked = revoked_at.is_some(), "provisional message verified");
                valid.sender_device_revoked_at = revoked_at;
                valid.key_status = KeyStatus::Verified;
                valid.sender_display = self.display_for(&valid).await;
                Resolved {
                    message: UnboxedMessage::Valid(valid),
                    modified: true,
                }
            }
            Err(kind) if kind.is_permanent() => {
                info!(msg_id = %msg_id, error = %kind, "provisional message rejected");
                Resolved {
                    message: UnboxedMessage::PermanentError(UnboxFailure {
                        kind,
                        message_id: msg_id,
                        message_type: valid.client_header.message_type,
                        is_ephemeral: valid.is_ephemeral(),
                    }),
                    modified: true,
                }
            }
            Err(kind) => {
                warn!(msg_id = %msg_id, error = %kind, "could not resolve provisional message");
                Resolved {
                    message: UnboxedMessage::Valid(valid),
                    modified: false,
                }
            }
        }
    }

    async fn display_for(&self, m: &ValidMessage) -> SenderDisplay {
        oracle::lookup_display(
            self.oracle.as_ref(),
            self.config.oracle_timeout(),
            &m.client_header.sender,
            &m.client_header.sender_device,
        )
        .await
    }

    // ── Oracle passthroughs ───────────────────────────────────────────────

    pub async fn valid_sender_key(
        &self,
        sender: &cb_proto::UserId,
        key_id: &KeyId,
        ctime: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, UnboxErrorKind> {
        oracle::check_sender_key(
            self.oracle.as_ref(),
            self.config.oracle_timeout(),
            sender,
            key_id,
            ctime,
        )
        .await
    }

    /// Encryption keys of every device of `users`, for pairwise MACs.
    pub async fn pairwise_recipients(
        &self,
        users: &[UserVersion],
    ) -> Result<Vec<DhPublicKey>, UnboxErrorKind> {
        oracle::load_encryption_keys(self.oracle.as_ref(), self.config.oracle_timeout(), users).await
    }
}

/// Chain-store bindings of one decoded header.
struct Bindings<'a> {
    conv: &'a ConversationId,
    id: MessageId,
    /// The body hash committed inside the sealed header.
    body_hash: &'a [u8],
    header_hash: &'a [u8],
    prevs: &'a [PreviousPointer],
}

impl Bindings<'_> {
    fn committed_body_hash(&self) -> Result<[u8; 32], UnboxErrorKind> {
        self.body_hash
            .try_into()
            .map_err(|_| UnboxErrorKind::Malformed("body hash is not 32 bytes".into()))
    }

    fn verify(&self, store: &dyn ChainStore) -> Result<(), UnboxErrorKind> {
        verify_replay(store, self.conv, &self.committed_body_hash()?, self.id)?;
        verify_chain(store, self.conv, self.id, self.header_hash, self.prevs)
    }

    /// Verifies both bindings before writing either.
    fn record(&self, store: &dyn ChainStore) -> Result<(), UnboxErrorKind> {
        self.verify(store)?;
        record_replay(store, self.conv, &self.committed_body_hash()?, self.id)?;
        record_chain(store, self.conv, self.id, self.header_hash, self.prevs)
    }
}

fn open(
    version: BoxedVersion,
    data: &EncryptedData,
    key: &[u8; 32],
    verify_key: Option<&VerifyKey>,
) -> Result<Zeroizing<Vec<u8>>, UnboxErrorKind> {
    if version.uses_signencrypt() {
        let verify_key = verify_key.ok_or(UnboxErrorKind::SignatureInvalid)?;
        Ok(signencrypt::open(&data.e, key, &data.n, verify_key)?)
    } else {
        Ok(aead::open(key, &data.n, &data.e, &[])?)
    }
}

/// The outer header is unauthenticated; every field the server could act
/// on must agree with the sealed copy.
fn compare_headers(
    sealed: &MessageClientHeader,
    outer: &MessageClientHeader,
) -> Result<(), UnboxErrorKind> {
    if sealed.sender != outer.sender {
        return Err(UnboxErrorKind::SenderMismatch);
    }
    if sealed.outbox_id.is_some() && outer.outbox_id.is_none() {
        return Err(UnboxErrorKind::HeaderFieldMissing { field: "outbox_id" });
    }

    let mismatch = |field| Err(UnboxErrorKind::HeaderMismatch { field });
    if sealed.conv != outer.conv {
        return mismatch("conv");
    }
    if sealed.tlf_name != outer.tlf_name {
        return mismatch("tlf_name");
    }
    if sealed.tlf_public != outer.tlf_public {
        return mismatch("tlf_public");
    }
    if sealed.message_type != outer.message_type {
        return mismatch("message_type");
    }
    if sealed.supersedes != outer.supersedes {
        return mismatch("supersedes");
    }
    if sealed.deletes != outer.deletes {
        return mismatch("deletes");
    }
    if sealed.prev != outer.prev {
        return mismatch("prev");
    }
    if sealed.delete_history != outer.delete_history {
        return mismatch("delete_history");
    }
    if sealed.sender_device != outer.sender_device {
        return mismatch("sender_device");
    }
    if sealed.merkle_root != outer.merkle_root {
        return mismatch("merkle_root");
    }
    if sealed.outbox_id != outer.outbox_id {
        return mismatch("outbox_id");
    }
    if sealed.outbox_info != outer.outbox_info {
        return mismatch("outbox_info");
    }
    if sealed.ephemeral_metadata != outer.ephemeral_metadata {
        return mismatch("ephemeral_metadata");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::MemoryChainStore, error::OracleError};
    use cb_proto::message::{DeviceId, MessageType, OutboxId, TopicType, UserId};

    struct AcceptAll;

    #[async_trait::async_trait]
    impl KeyOracle for AcceptAll {
        async fn valid_sender_key(
            &self,
            _: &UserId,
            _: &KeyId,
            _: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, OracleError> {
            Ok(None)
        }

        async fn batch_load_encryption_keys(
            &self,
            _: &[UserVersion],
        ) -> Result<Vec<DhPublicKey>, OracleError> {
            Ok(Vec::new())
        }

        async fn sender_display(&self, _: &UserId, _: &DeviceId) -> Result<SenderDisplay, OracleError> {
            Ok(SenderDisplay::default())
        }
    }

    fn header() -> MessageClientHeader {
        MessageClientHeader {
            conv: ConversationIdTriple {
                tlf_id: b"tlf".to_vec(),
                topic_type: TopicType::Chat,
                topic_id: b"topic".to_vec(),
            },
            tlf_name: "alice,bob".into(),
            tlf_public: false,
            message_type: MessageType::Text,
            supersedes: None,
            deletes: vec![],
            prev: vec![],
            delete_history: None,
            sender: UserId("alice".into()),
            sender_device: DeviceId("laptop".into()),
            merkle_root: None,
            outbox_id: None,
            outbox_info: None,
            ephemeral_metadata: None,
        }
    }

    #[test]
    fn identical_headers_match() {
        assert!(compare_headers(&header(), &header()).is_ok());
    }

    #[test]
    fn sender_difference_is_sender_mismatch() {
        let mut outer = header();
        outer.sender = UserId("mallory".into());
        assert_eq!(compare_headers(&header(), &outer), Err(UnboxErrorKind::SenderMismatch));
    }

    #[test]
    fn missing_outer_outbox_id_is_reported_as_missing_field() {
        let mut sealed = header();
        sealed.outbox_id = Some(OutboxId(vec![1, 2, 3]));
        assert_eq!(
            compare_headers(&sealed, &header()),
            Err(UnboxErrorKind::HeaderFieldMissing { field: "outbox_id" })
        );
    }

    #[test]
    fn other_fields_name_themselves() {
        let mut outer = header();
        outer.supersedes = Some(MessageId(3));
        assert_eq!(
            compare_headers(&header(), &outer),
            Err(UnboxErrorKind::HeaderMismatch { field: "supersedes" })
        );

        let mut outer = header();
        outer.tlf_public = true;
        assert_eq!(
            compare_headers(&header(), &outer),
            Err(UnboxErrorKind::HeaderMismatch { field: "tlf_public" })
        );
    }

    #[tokio::test]
    async fn sealed_empty_body_is_rejected() {
        let boxer = Boxer::new(
            BoxerConfig::default(),
            Arc::new(AcceptAll),
            Arc::new(MemoryChainStore::new()),
        )
        .unwrap();
        let key = ConversationKey::generate(1);
        let signer = SigningKeyPair::generate();
        let mut client_header = header();
        client_header.message_type = MessageType::Delete;
        client_header.deletes = vec![MessageId(3)];
        let msg = PlaintextMessage {
            client_header,
            body: MessageBody::Empty,
        };
        let args = || BoxArgs {
            key: &key,
            ephemeral_key: None,
            signing_key: &signer,
            version: Some(2),
            pairwise: None,
        };

        assert!(matches!(boxer.box_message(&msg, args()), Err(BoxingError::EmptyBody)));

        // Sealed anyway, e.g. by a modified client.
        let mut boxed = boxer.seal_message(&msg, args()).unwrap();
        assert!(!boxed.body_ciphertext.is_deleted());
        boxed.server_header = Some(ServerHeader {
            message_id: MessageId(4),
            ctime: Utc::now(),
            superseded_by: None,
        });
        let conv = ConversationInfo::from_triple(&boxed.client_header.conv);
        let keys = UnboxKeys {
            key: &key,
            ephemeral_key: None,
            device_key: None,
        };
        let result = boxer.unbox_message(&boxed, &conv, keys).await;
        assert!(matches!(result.error_kind(), Some(UnboxErrorKind::Malformed(_))));
    }
}
