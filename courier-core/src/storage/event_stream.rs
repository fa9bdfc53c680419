//! Append-only batch file containers.
//!
//! An [`EventStream`] holds at most one open file. Files are identified by
//! path: absolute paths for [`FileEventStream`], bare names for
//! [`InMemoryEventStream`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Suffix carried by the open (not yet upload-eligible) batch file.
pub const OPEN_FILE_SUFFIX: &str = ".tmp";

pub trait EventStream: Send {
    /// Size in bytes of the open file (0 when nothing is open).
    fn length(&self) -> u64;

    fn is_opened(&self) -> bool;

    /// Open `name`, closing any other open file first. Returns true when the
    /// file did not exist before.
    fn open_or_create(&mut self, name: &str) -> Result<bool>;

    /// Append to the open file. No-op when nothing is open.
    fn write(&mut self, content: &str) -> Result<()>;

    /// Every file in the container, open or closed.
    fn read(&self) -> Result<Vec<PathBuf>>;

    fn remove(&mut self, file: &Path) -> Result<()>;

    fn close(&mut self);

    /// Close the open file and drop its [`OPEN_FILE_SUFFIX`]. An existing
    /// closed file of the same name is never replaced.
    fn finish_and_close(&mut self) -> Result<()>;

    fn read_as_stream(&self, file: &Path) -> Option<Box<dyn Read + Send>>;
}

fn closed_name(name: &str) -> &str {
    name.strip_suffix(OPEN_FILE_SUFFIX).unwrap_or(name)
}

// ============================================
// On-disk stream
// ============================================

pub struct FileEventStream {
    directory: PathBuf,
    current: Option<OpenFile>,
}

struct OpenFile {
    path: PathBuf,
    handle: File,
}

impl FileEventStream {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            current: None,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl EventStream for FileEventStream {
    fn length(&self) -> u64 {
        self.current
            .as_ref()
            .and_then(|f| f.handle.metadata().ok())
            .map_or(0, |m| m.len())
    }

    fn is_opened(&self) -> bool {
        self.current.is_some()
    }

    fn open_or_create(&mut self, name: &str) -> Result<bool> {
        let path = self.directory.join(name);
        if self.current.as_ref().is_some_and(|f| f.path == path) {
            return Ok(false);
        }
        self.close();

        let created = !path.exists();
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current = Some(OpenFile { path, handle });
        Ok(created)
    }

    fn write(&mut self, content: &str) -> Result<()> {
        if let Some(file) = self.current.as_mut() {
            file.handle.write_all(content.as_bytes())?;
            file.handle.flush()?;
        }
        Ok(())
    }

    fn read(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn remove(&mut self, file: &Path) -> Result<()> {
        match std::fs::remove_file(file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        self.current = None;
    }

    fn finish_and_close(&mut self) -> Result<()> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };
        file.handle.sync_all()?;
        drop(file.handle);

        if let Some(name) = file.path.file_name().and_then(|n| n.to_str()) {
            let target = self.directory.join(closed_name(name));
            if target.exists() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("batch {} already exists", target.display()),
                )
                .into());
            }
            std::fs::rename(&file.path, target)?;
        }
        Ok(())
    }

    fn read_as_stream(&self, file: &Path) -> Option<Box<dyn Read + Send>> {
        File::open(file)
            .ok()
            .map(|f| Box::new(f) as Box<dyn Read + Send>)
    }
}

// ============================================
// In-memory stream
// ============================================

#[derive(Default)]
pub struct InMemoryEventStream {
    directory: BTreeMap<String, String>,
    current: Option<String>,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStream for InMemoryEventStream {
    fn length(&self) -> u64 {
        self.current
            .as_ref()
            .and_then(|name| self.directory.get(name))
            .map_or(0, |content| content.len() as u64)
    }

    fn is_opened(&self) -> bool {
        self.current.is_some()
    }

    fn open_or_create(&mut self, name: &str) -> Result<bool> {
        if self.current.as_deref() == Some(name) {
            return Ok(false);
        }
        self.close();

        let created = !self.directory.contains_key(name);
        self.directory.entry(name.to_string()).or_default();
        self.current = Some(name.to_string());
        Ok(created)
    }

    fn write(&mut self, content: &str) -> Result<()> {
        if let Some(file) = self
            .current
            .as_ref()
            .and_then(|name| self.directory.get_mut(name))
        {
            file.push_str(content);
        }
        Ok(())
    }

    fn read(&self) -> Result<Vec<PathBuf>> {
        Ok(self.directory.keys().map(PathBuf::from).collect())
    }

    fn remove(&mut self, file: &Path) -> Result<()> {
        if let Some(name) = file.to_str() {
            self.directory.remove(name);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.current = None;
    }

    fn finish_and_close(&mut self) -> Result<()> {
        if let Some(name) = self.current.take() {
            if let Some(content) = self.directory.remove(&name) {
                self.directory.insert(closed_name(&name).to_string(), content);
            }
        }
        Ok(())
    }

    fn read_as_stream(&self, file: &Path) -> Option<Box<dyn Read + Send>> {
        let content = self.directory.get(file.to_str()?)?;
        Some(Box::new(Cursor::new(content.clone().into_bytes())))
    }
}
