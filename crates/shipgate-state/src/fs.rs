//! File-backed stores.
//!
//! Every write goes through a temp file in the destination directory followed
//! by a rename, so readers never observe a half-written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StateError;
use crate::storage_traits::{
    ContentDigest, FingerprintStore, FingerprintTable, PublishRecord, PublishRegistry,
    StorageResult, VersionStore,
};

/// Atomically replace `path` with `data`, creating parent directories.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StateError::io(&dir, e))?;
    tmp.write_all(data).map_err(|e| StateError::io(path, e))?;
    tmp.persist(path).map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}

fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StateError::io(path, e)),
    }
}

// ---------------------------------------------------------------------------
// FsFingerprintStore
// ---------------------------------------------------------------------------

/// Fingerprints kept in a single JSON document.
///
/// A process-local mutex serialises read-modify-write cycles; concurrent
/// executors in different processes are not supported.
pub struct FsFingerprintStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FsFingerprintStore {
    /// Use `<state_dir>/fingerprints.json`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("fingerprints.json"),
            lock: Mutex::new(()),
        }
    }

    fn read_table(&self) -> StorageResult<FingerprintTable> {
        match read_optional(&self.path)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StateError::serde(&self.path, e))
            }
            None => Ok(FingerprintTable::default()),
        }
    }

    fn write_table(&self, table: &FingerprintTable) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec_pretty(table).map_err(|e| StateError::serde(&self.path, e))?;
        write_atomic(&self.path, &bytes)
    }
}

impl FingerprintStore for FsFingerprintStore {
    fn load(&self, task: &str) -> StorageResult<Option<ContentDigest>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_table()?.tasks.get(task).cloned())
    }

    fn save(&self, task: &str, fingerprint: &ContentDigest) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut table = self.read_table()?;
        table.tasks.insert(task.to_string(), fingerprint.clone());
        self.write_table(&table)
    }

    fn invalidate(&self, task: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut table = self.read_table()?;
        if table.tasks.remove(task).is_some() {
            self.write_table(&table)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsVersionStore
// ---------------------------------------------------------------------------

/// The resolved version as a one-line file (e.g. `build/version` = `v1.4.3`).
pub struct FsVersionStore {
    path: PathBuf,
}

impl FsVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionStore for FsVersionStore {
    fn load(&self) -> StorageResult<Option<String>> {
        Ok(read_optional(&self.path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    fn save(&self, version: &str) -> StorageResult<()> {
        // Skip identical rewrites so the file stays a stable task input.
        if self.load()?.as_deref() == Some(version) {
            return Ok(());
        }
        debug!(path = %self.path.display(), version, "persisting resolved version");
        write_atomic(&self.path, version.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// FsPublishRegistry
// ---------------------------------------------------------------------------

/// Publish records stored as `<root>/<name>/<version>.json`.
pub struct FsPublishRegistry {
    root: PathBuf,
}

impl FsPublishRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(format!("{version}.json"))
    }
}

#[async_trait]
impl PublishRegistry for FsPublishRegistry {
    async fn is_published(&self, name: &str, version: &str) -> StorageResult<bool> {
        Ok(self.record_path(name, version).exists())
    }

    async fn record(&self, record: PublishRecord) -> StorageResult<()> {
        let path = self.record_path(&record.name, &record.version);
        if path.exists() {
            return Err(StateError::AlreadyPublished {
                name: record.name,
                version: record.version,
            });
        }
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| StateError::serde(&path, e))?;
        write_atomic(&path, &bytes)
    }

    async fn history(&self, name: &str) -> StorageResult<Vec<PublishRecord>> {
        let dir = self.root.join(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StateError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| StateError::io(&path, e))?;
            let record: PublishRecord =
                serde_json::from_slice(&bytes).map_err(|e| StateError::serde(&path, e))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        Ok(records)
    }
}
