//! Image file storage rooted at a directory.
//!
//! Both roles touch the filesystem through this store: the coordinator
//! writes composite images, participants check, read, and delete sources.
//! Writes are atomic so a crash never leaves a partial composite.

use std::fs;
use std::path::{Path, PathBuf};

use crate::atomic_io;
use crate::error::Result;

/// Directory-rooted image store.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Check whether an image file exists.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    /// Read an image file.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(name))?)
    }

    /// Atomically write an image file, overwriting any existing content.
    /// Overwriting with the same bytes is a no-op as observed by readers.
    pub fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        atomic_io::atomic_write(self.resolve(name), bytes)?;
        Ok(())
    }

    /// Delete an image file. Deleting a file that is already gone is not an
    /// error; decisions are replayed and the delete must stay idempotent.
    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.resolve(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
