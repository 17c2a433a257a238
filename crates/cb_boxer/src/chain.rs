//! Hash-chain integrity cache and message-ID replay bindings.
//!
//! Per conversation the store keeps two first-write-wins maps:
//!
//!   message id -> header hash   (own hashes and hashes asserted by prev pointers)
//!   body hash  -> message id    (detects a box re-served under another id)
//!
//! All writes are insert-if-absent returning the existing value, so two
//! racing unboxes can never both believe they recorded a binding.
//!
//! Chain-mismatch attribution depends on unbox order: if B (claiming a
//! wrong hash for A) is seen first, B's claim is recorded and A fails when
//! it arrives; if A is seen first, B fails.
//!
//! Only authenticated messages write. A provisional (quick-mode) unbox runs
//! the `verify_*` half against what is already recorded and leaves the
//! `record_*` half to `Boxer::resolve`.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};

use cb_crypto::hash::ct_eq;
use cb_proto::{ConversationId, MessageId, PreviousPointer};

use crate::error::UnboxErrorKind;

pub trait ChainStore: Send + Sync {
    fn header_hash(&self, conv: &ConversationId, id: MessageId) -> Option<Vec<u8>>;

    /// Returns the existing hash if one was already bound to `id`.
    fn put_header_hash_if_absent(
        &self,
        conv: &ConversationId,
        id: MessageId,
        hash: &[u8],
    ) -> Option<Vec<u8>>;

    fn body_hash_owner(&self, conv: &ConversationId, body_hash: &[u8; 32]) -> Option<MessageId>;

    /// Returns the existing message id if `body_hash` was already seen.
    fn put_body_hash_if_absent(
        &self,
        conv: &ConversationId,
        body_hash: &[u8; 32],
        id: MessageId,
    ) -> Option<MessageId>;
}

#[derive(Default)]
struct ConversationChain {
    header_hashes: HashMap<MessageId, Vec<u8>>,
    body_hashes: HashMap<[u8; 32], MessageId>,
}

/// In-memory store: a per-conversation mutex behind an outer map lock, so
/// conversations never contend with each other.
#[derive(Default)]
pub struct MemoryChainStore {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<ConversationChain>>>>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversation(&self, conv: &ConversationId) -> Arc<Mutex<ConversationChain>> {
        if let Some(chain) = self.conversations.read().get(conv) {
            return Arc::clone(chain);
        }
        Arc::clone(self.conversations.write().entry(*conv).or_default())
    }
}

impl ChainStore for MemoryChainStore {
    fn header_hash(&self, conv: &ConversationId, id: MessageId) -> Option<Vec<u8>> {
        self.conversations
            .read()
            .get(conv)
            .and_then(|chain| chain.lock().header_hashes.get(&id).cloned())
    }

    fn put_header_hash_if_absent(
        &self,
        conv: &ConversationId,
        id: MessageId,
        hash: &[u8],
    ) -> Option<Vec<u8>> {
        let chain = self.conversation(conv);
        let mut chain = chain.lock();
        match chain.header_hashes.get(&id) {
            Some(existing) => Some(existing.clone()),
            None => {
                chain.header_hashes.insert(id, hash.to_vec());
                None
            }
        }
    }

    fn body_hash_owner(&self, conv: &ConversationId, body_hash: &[u8; 32]) -> Option<MessageId> {
        self.conversations
            .read()
            .get(conv)
            .and_then(|chain| chain.lock().body_hashes.get(body_hash).copied())
    }

    fn put_body_hash_if_absent(
        &self,
        conv: &ConversationId,
        body_hash: &[u8; 32],
        id: MessageId,
    ) -> Option<MessageId> {
        let chain = self.conversation(conv);
        let mut chain = chain.lock();
        match chain.body_hashes.get(body_hash) {
            Some(existing) => Some(*existing),
            None => {
                chain.body_hashes.insert(*body_hash, id);
                None
            }
        }
    }
}

/// Read-only replay check against bindings already recorded.
pub(crate) fn verify_replay(
    store: &dyn ChainStore,
    conv: &ConversationId,
    body_hash: &[u8; 32],
    id: MessageId,
) -> Result<(), UnboxErrorKind> {
    match store.body_hash_owner(conv, body_hash) {
        Some(existing) if existing != id => Err(UnboxErrorKind::IdReplayMismatch { existing }),
        _ => Ok(()),
    }
}

/// Bind `body_hash` to `id`; the same body under a different id is a replay.
pub(crate) fn record_replay(
    store: &dyn ChainStore,
    conv: &ConversationId,
    body_hash: &[u8; 32],
    id: MessageId,
) -> Result<(), UnboxErrorKind> {
    match store.put_body_hash_if_absent(conv, body_hash, id) {
        Some(existing) if existing != id => Err(UnboxErrorKind::IdReplayMismatch { existing }),
        _ => Ok(()),
    }
}

/// Read-only chain check: claims about known messages, and our own hash
/// against any speculative binding made by a later message.
pub(crate) fn verify_chain(
    store: &dyn ChainStore,
    conv: &ConversationId,
    id: MessageId,
    header_hash: &[u8],
    prevs: &[PreviousPointer],
) -> Result<(), UnboxErrorKind> {
    for prev in prevs {
        if let Some(known) = store.header_hash(conv, prev.id) {
            if !ct_eq(&known, &prev.hash) {
                return Err(UnboxErrorKind::ChainMismatch { id: prev.id });
            }
        }
    }
    if let Some(existing) = store.header_hash(conv, id) {
        if !ct_eq(&existing, header_hash) {
            return Err(UnboxErrorKind::ChainMismatch { id });
        }
    }
    Ok(())
}

/// Check and record the hash-chain bindings of one authenticated header.
pub(crate) fn record_chain(
    store: &dyn ChainStore,
    conv: &ConversationId,
    id: MessageId,
    header_hash: &[u8],
    prevs: &[PreviousPointer],
) -> Result<(), UnboxErrorKind> {
    verify_chain(store, conv, id, header_hash, prevs)?;

    // Our own true hash; a racing writer may have bound a different one.
    if let Some(existing) = store.put_header_hash_if_absent(conv, id, header_hash) {
        if !ct_eq(&existing, header_hash) {
            return Err(UnboxErrorKind::ChainMismatch { id });
        }
    }

    // Speculatively record what we assert.
    for prev in prevs {
        if let Some(existing) = store.put_header_hash_if_absent(conv, prev.id, &prev.hash) {
            if !ct_eq(&existing, &prev.hash) {
                return Err(UnboxErrorKind::ChainMismatch { id: prev.id });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId([7u8; 32])
    }

    fn prev(id: u32, hash: &[u8]) -> PreviousPointer {
        PreviousPointer {
            id: MessageId(id),
            hash: hash.to_vec(),
        }
    }

    #[test]
    fn first_write_wins() {
        let store = MemoryChainStore::new();
        assert_eq!(store.put_header_hash_if_absent(&conv(), MessageId(1), b"a"), None);
        assert_eq!(
            store.put_header_hash_if_absent(&conv(), MessageId(1), b"b"),
            Some(b"a".to_vec())
        );
        assert_eq!(store.header_hash(&conv(), MessageId(1)), Some(b"a".to_vec()));
    }

    #[test]
    fn conversations_are_independent() {
        let store = MemoryChainStore::new();
        let other = ConversationId([8u8; 32]);
        store.put_header_hash_if_absent(&conv(), MessageId(1), b"a");
        assert_eq!(store.header_hash(&other, MessageId(1)), None);
    }

    #[test]
    fn later_message_blamed_when_earlier_seen_first() {
        let store = MemoryChainStore::new();
        record_chain(&store, &conv(), MessageId(1), b"true-hash", &[]).unwrap();
        let err = record_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"bogus")]).unwrap_err();
        assert_eq!(err, UnboxErrorKind::ChainMismatch { id: MessageId(1) });
    }

    #[test]
    fn earlier_message_blamed_when_later_seen_first() {
        let store = MemoryChainStore::new();
        record_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"bogus")]).unwrap();
        let err = record_chain(&store, &conv(), MessageId(1), b"true-hash", &[]).unwrap_err();
        assert_eq!(err, UnboxErrorKind::ChainMismatch { id: MessageId(1) });
    }

    #[test]
    fn consistent_chain_passes_in_any_order() {
        let store = MemoryChainStore::new();
        record_chain(&store, &conv(), MessageId(3), b"h3", &[prev(2, b"h2"), prev(1, b"h1")]).unwrap();
        record_chain(&store, &conv(), MessageId(1), b"h1", &[]).unwrap();
        record_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"h1")]).unwrap();
        // Re-unboxing is idempotent.
        record_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"h1")]).unwrap();
    }

    #[test]
    fn replay_under_new_id_is_rejected() {
        let store = MemoryChainStore::new();
        let body = [1u8; 32];
        record_replay(&store, &conv(), &body, MessageId(5)).unwrap();
        record_replay(&store, &conv(), &body, MessageId(5)).unwrap();
        assert_eq!(
            record_replay(&store, &conv(), &body, MessageId(6)).unwrap_err(),
            UnboxErrorKind::IdReplayMismatch { existing: MessageId(5) }
        );
    }

    #[test]
    fn verify_does_not_write() {
        let store = MemoryChainStore::new();
        verify_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"bogus")]).unwrap();
        verify_replay(&store, &conv(), &[3u8; 32], MessageId(2)).unwrap();
        assert_eq!(store.header_hash(&conv(), MessageId(1)), None);
        assert_eq!(store.header_hash(&conv(), MessageId(2)), None);
        assert_eq!(store.body_hash_owner(&conv(), &[3u8; 32]), None);

        // A genuine message 1 is unaffected.
        record_chain(&store, &conv(), MessageId(1), b"true-hash", &[]).unwrap();
    }

    #[test]
    fn verify_sees_recorded_bindings() {
        let store = MemoryChainStore::new();
        record_chain(&store, &conv(), MessageId(1), b"true-hash", &[]).unwrap();
        record_replay(&store, &conv(), &[4u8; 32], MessageId(1)).unwrap();

        assert_eq!(
            verify_chain(&store, &conv(), MessageId(2), b"h2", &[prev(1, b"bogus")]).unwrap_err(),
            UnboxErrorKind::ChainMismatch { id: MessageId(1) }
        );
        assert_eq!(
            verify_chain(&store, &conv(), MessageId(1), b"other", &[]).unwrap_err(),
            UnboxErrorKind::ChainMismatch { id: MessageId(1) }
        );
        assert_eq!(
            verify_replay(&store, &conv(), &[4u8; 32], MessageId(9)).unwrap_err(),
            UnboxErrorKind::IdReplayMismatch { existing: MessageId(1) }
        );
    }
}
