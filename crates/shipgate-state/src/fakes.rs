//! In-memory fakes for tests.
//!
//! Provides `MemoryFingerprintStore`, `MemoryVersionStore` and
//! `MemoryPublishRegistry` that satisfy the trait contracts without touching
//! the filesystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StateError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryFingerprintStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    tasks: Mutex<HashMap<String, ContentDigest>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn load(&self, task: &str) -> StorageResult<Option<ContentDigest>> {
        Ok(self.tasks.lock().unwrap().get(task).cloned())
    }

    fn save(&self, task: &str, fingerprint: &ContentDigest) -> StorageResult<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.to_string(), fingerprint.clone());
        Ok(())
    }

    fn invalidate(&self, task: &str) -> StorageResult<()> {
        self.tasks.lock().unwrap().remove(task);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryVersionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    value: Mutex<Option<String>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for MemoryVersionStore {
    fn load(&self) -> StorageResult<Option<String>> {
        Ok(self.value.lock().unwrap().clone())
    }

    fn save(&self, version: &str) -> StorageResult<()> {
        *self.value.lock().unwrap() = Some(version.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublishRegistry
// ---------------------------------------------------------------------------

/// In-memory publish registry backed by a `HashMap<name, Vec<PublishRecord>>`.
///
/// Counts successful `record` calls so tests can assert nothing was
/// re-published.
#[derive(Debug, Default)]
pub struct MemoryPublishRegistry {
    records: Mutex<HashMap<String, Vec<PublishRecord>>>,
    writes: AtomicUsize,
}

impl MemoryPublishRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records accepted so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishRegistry for MemoryPublishRegistry {
    async fn is_published(&self, name: &str, version: &str) -> StorageResult<bool> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(name)
            .map(|list| list.iter().any(|r| r.version == version))
            .unwrap_or(false))
    }

    async fn record(&self, record: PublishRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        let list = records.entry(record.name.clone()).or_default();
        if list.iter().any(|r| r.version == record.version) {
            return Err(StateError::AlreadyPublished {
                name: record.name,
                version: record.version,
            });
        }
        list.push(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn history(&self, name: &str) -> StorageResult<Vec<PublishRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}
