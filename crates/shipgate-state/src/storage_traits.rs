//! Storage trait definitions for shipgate persistence.
//!
//! These traits define the persisted state a pipeline run touches:
//! - `FingerprintStore`: last successful input/output fingerprint per task
//! - `VersionStore`: the single resolved version value read by downstream stages
//! - `PublishRegistry`: append-only record of published (name, version) pairs
//!
//! File-backed implementations live in `fs`; in-memory fakes for tests in `fakes`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StateError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex produced
/// by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Wrap a finished hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StateError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StateError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FingerprintStore
// ---------------------------------------------------------------------------

/// Last-successful-run fingerprints keyed by task name.
///
/// The executor compares a freshly computed fingerprint with the stored one
/// to decide whether a task is up-to-date.
pub trait FingerprintStore: Send + Sync {
    /// Fingerprint recorded after the task's last successful run.
    fn load(&self, task: &str) -> StorageResult<Option<ContentDigest>>;

    /// Record the fingerprint of a successful run.
    fn save(&self, task: &str, fingerprint: &ContentDigest) -> StorageResult<()>;

    /// Forget the task's fingerprint so the next run executes it.
    fn invalidate(&self, task: &str) -> StorageResult<()>;
}

/// Serialized form of the fingerprint file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FingerprintTable {
    pub tasks: BTreeMap<String, ContentDigest>,
}

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

/// Single persisted resolved version.
///
/// Stored as `v<MAJOR>.<MINOR>.<PATCH>`; callers own the parsing.
pub trait VersionStore: Send + Sync {
    fn load(&self) -> StorageResult<Option<String>>;

    fn save(&self, version: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// PublishRegistry
// ---------------------------------------------------------------------------

/// One completed publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRecord {
    /// Artifact name (e.g. "vault-service")
    pub name: String,
    /// Released version string without prefix (e.g. "1.4.3")
    pub version: String,
    /// Digest of the artifact manifest that was published
    pub artifact_digest: ContentDigest,
    /// Where the artifact went (package repository path, image reference, ...)
    pub destinations: Vec<String>,
    /// When the publication was recorded
    pub published_at: DateTime<Utc>,
}

/// Release-immutable publish registry.
///
/// Semantics:
/// - `record` appends a new (name, version) entry and fails with
///   `StateError::AlreadyPublished` when the pair exists. Entries are never
///   overwritten.
/// - `history` returns records for a name, oldest first.
#[async_trait]
pub trait PublishRegistry: Send + Sync {
    async fn is_published(&self, name: &str, version: &str) -> StorageResult<bool>;

    async fn record(&self, record: PublishRecord) -> StorageResult<()>;

    async fn history(&self, name: &str) -> StorageResult<Vec<PublishRecord>>;
}
