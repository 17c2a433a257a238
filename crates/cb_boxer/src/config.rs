//! Boxer configuration, loaded from JSON.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use cb_crypto::signencrypt::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use cb_proto::version::{BoxedVersion, VersionLimits};

use crate::error::ConfigError;

/// `Quick` skips the key-validity oracle during unbox; the result is
/// provisional until passed through `Boxer::resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnboxMode {
    #[default]
    Full,
    Quick,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxerConfig {
    pub limits: VersionLimits,
    pub default_boxed_version: u32,
    pub unbox_mode: UnboxMode,
    pub oracle_timeout_ms: u64,
    pub signcrypt_chunk_size: usize,
}

impl Default for BoxerConfig {
    fn default() -> Self {
        Self {
            limits: VersionLimits::default(),
            default_boxed_version: 2,
            unbox_mode: UnboxMode::Full,
            oracle_timeout_ms: 10_000,
            signcrypt_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BoxerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if BoxedVersion::from_wire(self.default_boxed_version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "default_boxed_version {} is not a supported version",
                self.default_boxed_version
            )));
        }
        if self.default_boxed_version > self.limits.max_boxed_version {
            return Err(ConfigError::Invalid(format!(
                "default_boxed_version {} exceeds max_boxed_version {}",
                self.default_boxed_version, self.limits.max_boxed_version
            )));
        }
        if self.signcrypt_chunk_size == 0 || self.signcrypt_chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "signcrypt_chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {}",
                self.signcrypt_chunk_size
            )));
        }
        if self.oracle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("oracle_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}
