//! Batch file storage.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::event_stream::{EventStream, OPEN_FILE_SUFFIX};
use super::kvs::KeyValueStore;
use super::{Storage, StorageKey, MAX_BATCH_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{Error, Result};
use crate::events::iso_now;

const BATCH_BEGIN: &str = r#"{"batch":["#;

/// [`Storage`] over a key/value store and an event stream.
///
/// A single mutex guards the stream, so appends and rollovers never
/// interleave.
pub struct BatchStorage<K, S> {
    write_key: String,
    file_index_key: String,
    kvs: K,
    stream: Mutex<S>,
}

impl<K: KeyValueStore, S: EventStream> BatchStorage<K, S> {
    pub fn new(write_key: impl Into<String>, kvs: K, stream: S) -> Self {
        let write_key = write_key.into();
        Self {
            file_index_key: format!("courier.events.file.index.{write_key}"),
            write_key,
            kvs,
            stream: Mutex::new(stream),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>> {
        self.stream
            .lock()
            .map_err(|_| Error::Runtime("event stream lock poisoned".to_string()))
    }

    fn file_index(&self) -> u64 {
        self.kvs.get_int(&self.file_index_key, 0)
    }

    fn current_file(&self) -> String {
        format!("{}-{}{}", self.write_key, self.file_index(), OPEN_FILE_SUFFIX)
    }

    fn batch_end(&self) -> Result<String> {
        Ok(format!(
            r#"],"sentAt":"{}","writeKey":{}}}"#,
            iso_now(),
            serde_json::to_string(&self.write_key)?
        ))
    }

    /// Open the current file, writing the envelope header when it is new.
    /// Returns true when the file holds no events yet.
    fn open_current(&self, stream: &mut S) -> Result<bool> {
        let created = stream.open_or_create(&self.current_file())?;
        if created || stream.length() == 0 {
            stream.write(BATCH_BEGIN)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn perform_rollover(&self, stream: &mut S) -> Result<()> {
        if !stream.is_opened() {
            return Ok(());
        }
        // The index moves first: no later file may reuse the closing name,
        // even if the tail or the rename below fails.
        let closed = self.file_index();
        self.kvs.put_int(&self.file_index_key, closed + 1)?;
        stream.write(&self.batch_end()?)?;
        stream.finish_and_close()?;
        tracing::debug!(write_key = %self.write_key, index = closed, "Rolled over batch file");
        Ok(())
    }

    /// Whether `content` already ends with a closing envelope.
    fn has_batch_end(&self, content: &str) -> bool {
        serde_json::to_string(&self.write_key)
            .map(|write_key| content.ends_with(&format!(r#","writeKey":{write_key}}}"#)))
            .unwrap_or(false)
    }

    /// Index encoded in an open batch name (`<writeKey>-<index>.tmp`).
    fn open_index(&self, file: &Path) -> Option<u64> {
        let name = file.file_name()?.to_str()?;
        name.strip_suffix(OPEN_FILE_SUFFIX)?
            .strip_prefix(&self.write_key)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    /// Finalize open files below the current index. They are left behind
    /// when a rollover fails or the process dies part way through one. A
    /// file that already carries its tail is only renamed.
    fn recover_interrupted(&self, stream: &mut S) -> Result<()> {
        let current = self.file_index();
        for path in stream.read()? {
            let Some(index) = self.open_index(&path).filter(|index| *index < current) else {
                continue;
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            let mut content = String::new();
            if let Some(mut reader) = stream.read_as_stream(&path) {
                reader.read_to_string(&mut content)?;
            }
            if content.len() <= BATCH_BEGIN.len() {
                stream.close();
                stream.remove(&path)?;
                continue;
            }

            stream.open_or_create(&name)?;
            if !self.has_batch_end(&content) {
                stream.write(&self.batch_end()?)?;
            }
            stream.finish_and_close()?;
            tracing::info!(write_key = %self.write_key, index, "Recovered interrupted batch file");
        }
        Ok(())
    }

    /// Index encoded in a closed batch name (`<writeKey>-<index>`).
    fn batch_index(&self, file: &Path) -> Option<u64> {
        let name = file.file_name()?.to_str()?;
        if name.ends_with(OPEN_FILE_SUFFIX) {
            return None;
        }
        name.strip_prefix(&self.write_key)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}

impl<K: KeyValueStore, S: EventStream> Storage for BatchStorage<K, S> {
    fn write(&self, key: StorageKey, value: &str) -> Result<()> {
        self.kvs.put(key.raw_value(), value)
    }

    fn read(&self, key: StorageKey) -> Option<String> {
        self.kvs.get(key.raw_value())
    }

    fn remove(&self, key: StorageKey) -> bool {
        match self.kvs.remove(key.raw_value()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = key.raw_value(), error = %e, "Failed to remove key");
                false
            }
        }
    }

    fn write_event(&self, payload: &str) -> Result<()> {
        if payload.len() >= MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        let mut stream = self.lock()?;
        let mut empty = self.open_current(&mut stream)?;

        let appended = payload.len() as u64 + u64::from(!empty);
        if !empty && stream.length() + appended > MAX_BATCH_SIZE as u64 {
            self.perform_rollover(&mut stream)?;
            empty = self.open_current(&mut stream)?;
        }

        if empty {
            stream.write(payload)
        } else {
            stream.write(&format!(",{payload}"))
        }
    }

    fn read_event_files(&self) -> Result<Vec<PathBuf>> {
        let stream = self.lock()?;
        let mut files: Vec<(u64, PathBuf)> = stream
            .read()?
            .into_iter()
            .filter_map(|path| self.batch_index(&path).map(|index| (index, path)))
            .collect();
        files.sort_by_key(|(index, _)| *index);
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    fn read_as_stream(&self, file: &Path) -> Option<Box<dyn Read + Send>> {
        self.lock().ok()?.read_as_stream(file)
    }

    fn remove_file(&self, file: &Path) -> bool {
        let result = self.lock().and_then(|mut stream| stream.remove(file));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Failed to remove batch file");
                false
            }
        }
    }

    fn rollover(&self) -> Result<()> {
        let mut stream = self.lock()?;

        if let Err(e) = self.recover_interrupted(&mut stream) {
            tracing::warn!(write_key = %self.write_key, error = %e, "Batch recovery failed");
        }

        // A previous process may have left the current file open on disk.
        if !stream.is_opened() {
            let current = self.current_file();
            let leftover = stream
                .read()?
                .into_iter()
                .find(|path| path.file_name().and_then(|n| n.to_str()) == Some(current.as_str()));
            if let Some(path) = leftover {
                stream.open_or_create(&current)?;
                if stream.length() == 0 {
                    stream.close();
                    stream.remove(&path)?;
                    return Ok(());
                }
            }
        }

        self.perform_rollover(&mut stream)
    }
}
