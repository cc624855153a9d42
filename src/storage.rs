//! Synchronous key-value persistence for session credentials
//!
//! The credential store only needs `get`, `set` and `remove`. Two backends are
//! provided: an in-memory map and a JSON file in an XDG-compliant data
//! directory (`~/.local/share/pestdesk/session.json` on Linux).

use directories::ProjectDirs;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while persisting values
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file could not be encoded
    #[error("Failed to encode storage file: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Minimal synchronous key-value store
pub trait KeyValueStore: Send + Sync {
    /// Returns the value for `key`, or `None` if it is not set
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Volatile store backed by a map
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Durable store that keeps every key in a single JSON object on disk
///
/// The file is read once when the store is opened and rewritten on every
/// mutation, so reads never touch the filesystem. A mutation whose write to
/// disk fails still applies in memory; the error only means it will not
/// survive a restart.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Returns the default session file location
    ///
    /// Returns `None` if the data directory cannot be determined (e.g., no home directory).
    pub fn default_location() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "pestdesk")?;
        Some(project_dirs.data_dir().join("session.json"))
    }

    /// Opens the store at `path`, loading any existing values
    ///
    /// A missing file yields an empty store. A file that cannot be parsed is
    /// treated as empty and will be overwritten on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = fs::read_to_string(&path)
            .ok()
            .and_then(|content| match serde_json::from_str(&content) {
                Ok(values) => Some(values),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Ignoring unreadable session file"
                    );
                    None
                }
            })
            .unwrap_or_default();

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
