//! Symmetric key newtypes handed to the boxer by the conversation layer.

use rand::{rngs::OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Per-generation conversation encryption key.
#[derive(ZeroizeOnDrop)]
pub struct ConversationKey {
    #[zeroize(skip)]
    generation: u32,
    key: [u8; 32],
}

impl ConversationKey {
    pub fn new(generation: u32, key: [u8; 32]) -> Self {
        Self { generation, key }
    }

    pub fn generate(generation: u32) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { generation, key }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Time-bounded key used only for self-destructing messages.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKey {
    #[zeroize(skip)]
    generation: u32,
    key: [u8; 32],
}

impl EphemeralKey {
    pub fn new(generation: u32, key: [u8; 32]) -> Self {
        Self { generation, key }
    }

    pub fn generate(generation: u32) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { generation, key }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversationKey(gen={}, [redacted])", self.generation)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralKey(gen={}, [redacted])", self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = ConversationKey::generate(1);
        let b = ConversationKey::generate(1);
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.generation(), 1);
    }

    #[test]
    fn debug_does_not_leak_key() {
        let k = EphemeralKey::new(3, [0xAB; 32]);
        let s = format!("{k:?}");
        assert!(s.contains("gen=3"));
        assert!(!s.to_lowercase().contains("abab"));
    }
}
