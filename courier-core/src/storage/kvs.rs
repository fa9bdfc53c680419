//! Small last-write-wins key/value stores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Scalar string storage used for identity, cached settings, retry state and
/// the batch file index.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Returns true if the key was present.
    fn remove(&self, key: &str) -> Result<bool>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Integer view of a key; missing or unparsable values yield `default`.
    fn get_int(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn put_int(&self, key: &str, value: u64) -> Result<()> {
        self.put(key, &value.to_string())
    }
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Runtime("key/value store lock poisoned".to_string())
}

// ============================================
// File-backed store
// ============================================

/// JSON object on disk, rewritten atomically (temp file + rename) on every
/// mutation.
pub struct PropertiesFile {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl PropertiesFile {
    /// Open the store at `path`. A missing file starts empty; a corrupt one is
    /// logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let values = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Corrupt properties file, starting empty"
                );
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for PropertiesFile {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(lock_err)?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut values = self.values.lock().map_err(lock_err)?;
        let existed = values.remove(key).is_some();
        if existed {
            self.save(&values)?;
        }
        Ok(existed)
    }
}

// ============================================
// In-memory store
// ============================================

/// Process-local store, used by tests and the in-memory storage provider.
#[derive(Default)]
pub struct InMemoryPrefs {
    values: Mutex<BTreeMap<String, String>>,
}

impl InMemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryPrefs {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(lock_err)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.values.lock().map_err(lock_err)?.remove(key).is_some())
    }
}
