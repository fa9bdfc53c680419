//! Durable event queue and key/value persistence
//!
//! Events are appended to batch files that already carry the upload envelope:
//!
//! ```text
//! {"batch":[{...},{...}],"sentAt":"2026-01-01T00:00:00.000Z","writeKey":"wk"}
//! ```
//!
//! The open file is named `<writeKey>-<index>.tmp`; [`Storage::rollover`]
//! closes the envelope and drops the suffix, which makes it upload-eligible.
//! Scalar values (identity, cached settings, retry state) go through the
//! same [`Storage`] handle.

mod batch;
mod event_stream;
mod kvs;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

pub use batch::BatchStorage;
pub use event_stream::{EventStream, FileEventStream, InMemoryEventStream, OPEN_FILE_SUFFIX};
pub use kvs::{InMemoryPrefs, KeyValueStore, PropertiesFile};

/// Serialized events must be strictly smaller than this (bytes).
pub const MAX_PAYLOAD_SIZE: usize = 32_000;

/// Ceiling for one batch file. Below the server's 500 KB limit to leave room
/// for envelope fields.
pub const MAX_BATCH_SIZE: usize = 475_000;

/// Scalar keys persisted alongside the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    UserId,
    Traits,
    AnonymousId,
    Settings,
    AppVersion,
    AppBuild,
    RetryState,
}

impl StorageKey {
    pub fn raw_value(&self) -> &'static str {
        match self {
            StorageKey::UserId => "courier.userId",
            StorageKey::Traits => "courier.traits",
            StorageKey::AnonymousId => "courier.anonymousId",
            StorageKey::Settings => "courier.settings",
            StorageKey::AppVersion => "courier.app.version",
            StorageKey::AppBuild => "courier.app.build",
            StorageKey::RetryState => "courier.retryState",
        }
    }
}

/// Persistence contract consumed by the pipeline and the host.
///
/// Implementations must make [`rollover`](Storage::rollover) atomic with
/// respect to [`write_event`](Storage::write_event).
pub trait Storage: Send + Sync {
    fn write(&self, key: StorageKey, value: &str) -> Result<()>;

    fn read(&self, key: StorageKey) -> Option<String>;

    fn remove(&self, key: StorageKey) -> bool;

    /// Append a serialized event to the open batch. Fails with
    /// [`Error::PayloadTooLarge`](crate::Error::PayloadTooLarge) without
    /// touching disk when the payload is at or above [`MAX_PAYLOAD_SIZE`].
    fn write_event(&self, payload: &str) -> Result<()>;

    /// Closed, upload-eligible batch files, oldest first.
    fn read_event_files(&self) -> Result<Vec<PathBuf>>;

    fn read_as_stream(&self, file: &Path) -> Option<Box<dyn Read + Send>>;

    /// Delete a closed batch. Already-missing files count as removed.
    fn remove_file(&self, file: &Path) -> bool;

    /// Finalize the open batch, if any.
    fn rollover(&self) -> Result<()>;
}

/// Where a client keeps its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// Batch files under `<dir>/events`, key/value file in `<dir>`
    File(PathBuf),
    InMemory,
}

impl StorageProvider {
    pub fn create(&self, write_key: &str) -> Result<Arc<dyn Storage>> {
        match self {
            StorageProvider::File(dir) => {
                let prefs = PropertiesFile::open(dir.join(format!("courier-{write_key}.json")))?;
                let stream = FileEventStream::new(dir.join("events"))?;
                tracing::debug!(dir = %dir.display(), write_key, "Opened file storage");
                Ok(Arc::new(BatchStorage::new(write_key, prefs, stream)))
            }
            StorageProvider::InMemory => Ok(Arc::new(BatchStorage::new(
                write_key,
                InMemoryPrefs::new(),
                InMemoryEventStream::new(),
            ))),
        }
    }
}
