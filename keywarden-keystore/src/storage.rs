//! Storage backends: where the license key table lives.

use crate::error::StoreError;
use crate::types::LicenseKey;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Expiration purge
// ---------------------------------------------------------------------------

/// Drop every record whose deadline has passed.
///
/// Returns the surviving records and how many were removed. Backends run
/// this on every load so readers never observe stale-expired entries.
pub fn purge_expired(keys: Vec<LicenseKey>, now: DateTime<Utc>) -> (Vec<LicenseKey>, usize) {
    let before = keys.len();
    let kept: Vec<LicenseKey> = keys.into_iter().filter(|k| !k.is_expired(now)).collect();
    let removed = before - kept.len();
    (kept, removed)
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Backend for persisting the key table.
///
/// Both operations act on the whole collection; there is no row-level
/// persistence. `load` purges expired records first and persists the purge
/// when it removed anything.
///
/// Implementations:
/// - InMemoryBackend (testing)
/// - FileBackend (production: one JSON file)
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> Result<Vec<LicenseKey>, StoreError>;
    fn save(&self, keys: &[LicenseKey]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage (for testing and ephemeral use).
pub struct InMemoryBackend {
    keys: RwLock<Vec<LicenseKey>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(Vec::new()),
        }
    }

    /// Start with a pre-seeded table (for tests).
    pub fn with_keys(keys: Vec<LicenseKey>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn load(&self) -> Result<Vec<LicenseKey>, StoreError> {
        let snapshot = self.keys.read().unwrap().clone();
        let (kept, removed) = purge_expired(snapshot, Utc::now());
        if removed > 0 {
            *self.keys.write().unwrap() = kept.clone();
        }
        Ok(kept)
    }

    fn save(&self, keys: &[LicenseKey]) -> Result<(), StoreError> {
        *self.keys.write().unwrap() = keys.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// On-disk wire shape of the key table.
#[derive(serde::Serialize, serde::Deserialize)]
struct KeysFile {
    valid_keys: Vec<LicenseKey>,
}

/// File-based storage: the whole table in one JSON file.
///
/// ```text
/// {"valid_keys": [LicenseKey...]}
/// ```
///
/// A missing file is an empty collection, materialized on first load. An
/// existing file that does not parse is a fatal configuration error.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Write(format!("create dir: {}", e)))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_table(&self, keys: &[LicenseKey]) -> Result<(), StoreError> {
        let table = KeysFile {
            valid_keys: keys.to_vec(),
        };
        let json = serde_json::to_string_pretty(&table)
            .map_err(|e| StoreError::Write(format!("serialize: {}", e)))?;
        // Atomic write: write to temp, then rename
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json).map_err(|e| StoreError::Write(format!("write: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::Write(format!("rename: {}", e)))?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> Result<Vec<LicenseKey>, StoreError> {
        if !self.path.exists() {
            self.write_table(&[])?;
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Read(format!("read {}: {}", self.path.display(), e)))?;
        let table: KeysFile = serde_json::from_str(&data)
            .map_err(|e| StoreError::Corrupt(format!("parse {}: {}", self.path.display(), e)))?;

        let mut keys = table.valid_keys;
        for key in &mut keys {
            key.normalize();
        }

        let (kept, removed) = purge_expired(keys, Utc::now());
        if removed > 0 {
            tracing::info!(removed, "purged expired license keys");
            self.write_table(&kept)?;
        }
        Ok(kept)
    }

    fn save(&self, keys: &[LicenseKey]) -> Result<(), StoreError> {
        self.write_table(keys)
    }
}
