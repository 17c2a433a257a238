//! Format generations and the configured version ceiling.
//!
//! | boxed | seal strategy         | header pt | body pt | pairwise | ephemeral | dummy signer |
//! |-------|-----------------------|-----------|---------|----------|-----------|--------------|
//! | 0, 1  | AEAD + header sig     | v1        | v1      | no       | no        | no           |
//! | 2     | signencrypt           | v1        | v1      | no       | no        | no           |
//! | 3     | signencrypt           | v1        | v2      | yes      | yes       | no           |
//! | 4     | signencrypt           | v1        | v2      | required | yes       | yes          |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported boxed-message generations. `0` is the pre-versioning tag and
/// decodes as `V1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoxedVersion {
    V1,
    V2,
    V3,
    V4,
}

impl BoxedVersion {
    pub fn from_wire(version: u32) -> Option<Self> {
        match version {
            0 | 1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }

    pub fn uses_signencrypt(self) -> bool {
        self >= Self::V2
    }

    pub fn allows_pairwise(self) -> bool {
        self >= Self::V3
    }

    pub fn allows_ephemeral(self) -> bool {
        self >= Self::V3
    }

    /// Authenticity carried entirely by pairwise tags.
    pub fn allows_dummy_signer(self) -> bool {
        self >= Self::V4
    }

    pub fn requires_pairwise(self) -> bool {
        self == Self::V4
    }

    pub fn header_version(self) -> u32 {
        1
    }

    pub fn body_version(self) -> u32 {
        if self >= Self::V3 {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for BoxedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

/// Which versioned layer a version number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Boxed,
    Header,
    Body,
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boxed => "boxed",
            Self::Header => "header",
            Self::Body => "body",
        })
    }
}

/// Highest version of each layer this client will try to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionLimits {
    pub max_boxed_version: u32,
    pub max_header_version: u32,
    pub max_body_version: u32,
}

impl Default for VersionLimits {
    fn default() -> Self {
        Self {
            max_boxed_version: 4,
            max_header_version: 1,
            max_body_version: 2,
        }
    }
}

impl VersionLimits {
    pub fn max_for(&self, kind: VersionKind) -> u32 {
        match kind {
            VersionKind::Boxed => self.max_boxed_version,
            VersionKind::Header => self.max_header_version,
            VersionKind::Body => self.max_body_version,
        }
    }

    /// A version is critical when it is above the ceiling, or when the
    /// sender flagged it critical. Non-critical versions may become
    /// parseable after a client upgrade.
    pub fn is_critical(&self, kind: VersionKind, version: u32, crit_flag: bool) -> bool {
        crit_flag || version > self.max_for(kind)
    }
}
