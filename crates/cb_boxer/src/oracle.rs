//! Sender identity and key-validity gate.
//!
//! The boxer does not know which keys belong to whom. It asks a `KeyOracle`
//! (the identity layer) and bounds every call with a timeout; the oracle
//! call is the only place an unbox can suspend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use cb_crypto::{DhPublicKey, KeyId};
use cb_proto::message::{DeviceId, UserId};

use crate::error::{OracleError, UnboxErrorKind};

/// A user pinned to one account generation (eldest sigchain seqno).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserVersion {
    pub uid: UserId,
    pub eldest_seqno: u64,
}

/// Human-facing sender identity attached to unboxed messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderDisplay {
    pub username: String,
    pub device_name: String,
    pub device_type: String,
}

impl SenderDisplay {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.device_name.is_empty() && self.device_type.is_empty()
    }
}

#[async_trait]
pub trait KeyOracle: Send + Sync {
    /// Whether `key_id` belonged to `sender` at `ctime`.
    ///
    /// - `Ok(None)`: valid, never revoked
    /// - `Ok(Some(t))`: valid at `ctime`, revoked later at `t`
    /// - `Err(NoKey)`: never valid for this sender at `ctime`
    /// - `Err(Unavailable)`: could not be determined right now
    async fn valid_sender_key(
        &self,
        sender: &UserId,
        key_id: &KeyId,
        ctime: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, OracleError>;

    /// Current per-device encryption keys of every listed user.
    async fn batch_load_encryption_keys(
        &self,
        users: &[UserVersion],
    ) -> Result<Vec<DhPublicKey>, OracleError>;

    async fn sender_display(
        &self,
        sender: &UserId,
        device: &DeviceId,
    ) -> Result<SenderDisplay, OracleError>;
}

fn oracle_failure(err: OracleError) -> UnboxErrorKind {
    match err {
        OracleError::NoKey(msg) => UnboxErrorKind::SenderKeyInvalid(msg),
        OracleError::Unavailable(msg) => UnboxErrorKind::IdentityOracleUnavailable(msg),
    }
}

pub(crate) async fn check_sender_key(
    oracle: &dyn KeyOracle,
    timeout: Duration,
    sender: &UserId,
    key_id: &KeyId,
    ctime: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, UnboxErrorKind> {
    match tokio::time::timeout(timeout, oracle.valid_sender_key(sender, key_id, ctime)).await {
        Ok(result) => result.map_err(oracle_failure),
        Err(_) => Err(UnboxErrorKind::IdentityOracleUnavailable(format!(
            "key lookup timed out after {timeout:?}"
        ))),
    }
}

pub(crate) async fn load_encryption_keys(
    oracle: &dyn KeyOracle,
    timeout: Duration,
    users: &[UserVersion],
) -> Result<Vec<DhPublicKey>, UnboxErrorKind> {
    match tokio::time::timeout(timeout, oracle.batch_load_encryption_keys(users)).await {
        Ok(result) => result.map_err(oracle_failure),
        Err(_) => Err(UnboxErrorKind::IdentityOracleUnavailable(format!(
            "encryption key load timed out after {timeout:?}"
        ))),
    }
}

/// Display lookups never fail an unbox; they degrade to an empty identity.
pub(crate) async fn lookup_display(
    oracle: &dyn KeyOracle,
    timeout: Duration,
    sender: &UserId,
    device: &DeviceId,
) -> SenderDisplay {
    match tokio::time::timeout(timeout, oracle.sender_display(sender, device)).await {
        Ok(Ok(display)) => display,
        Ok(Err(err)) => {
            warn!(sender = %sender.0, error = %err, "sender display lookup failed");
            SenderDisplay::default()
        }
        Err(_) => {
            warn!(sender = %sender.0, "sender display lookup timed out");
            SenderDisplay::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowOracle;

    #[async_trait]
    impl KeyOracle for SlowOracle {
        async fn valid_sender_key(
            &self,
            _: &UserId,
            _: &KeyId,
            _: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn batch_load_encryption_keys(
            &self,
            _: &[UserVersion],
        ) -> Result<Vec<DhPublicKey>, OracleError> {
            Err(OracleError::Unavailable("offline".into()))
        }

        async fn sender_display(&self, _: &UserId, _: &DeviceId) -> Result<SenderDisplay, OracleError> {
            Err(OracleError::NoKey("unknown device".into()))
        }
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let key = cb_crypto::SigningKeyPair::generate().key_id();
        let err = check_sender_key(
            &SlowOracle,
            Duration::from_millis(10),
            &UserId("alice".into()),
            &key,
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UnboxErrorKind::IdentityOracleUnavailable(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn unavailable_maps_to_transient() {
        let err = load_encryption_keys(&SlowOracle, Duration::from_secs(1), &[])
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn display_failure_degrades_to_empty() {
        let display = lookup_display(
            &SlowOracle,
            Duration::from_secs(1),
            &UserId("alice".into()),
            &DeviceId("phone".into()),
        )
        .await;
        assert!(display.is_empty());
    }
}
