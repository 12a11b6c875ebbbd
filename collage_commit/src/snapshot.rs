// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable state snapshots for the protocol roles.
//!
//! Each role serializes its entire state into a single file and flushes it
//! to stable storage before any peer can observe the transition; the file is
//! replayed at startup. Every write is a complete atomic rewrite, so
//! recovery yields exactly the last successfully flushed snapshot.
//!
//! ## Critical Invariants
//!
//! 1. State transitions MUST be persisted before a message announcing them
//!    is sent (log-before-send)
//! 2. A snapshot write is atomic with respect to crashes
//! 3. A corrupt or unreadable snapshot recovers to the empty state

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::atomic_io;
use crate::error::Result;

/// Snapshot-based durable log, one file per role.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store backed by the given file. Nothing is touched on disk
    /// until the first `persist`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a full state snapshot and flush it to stable storage.
    pub fn persist<S: Serialize>(&self, state: &S) -> Result<()> {
        let bytes = bincode::serialize(state)?;
        atomic_io::atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    /// Load the last flushed snapshot.
    ///
    /// Returns `None` when no snapshot exists yet, or when the file is
    /// corrupt; corruption is logged and treated as an empty state (any
    /// in-flight data is lost by definition).
    pub fn load<S: DeserializeOwned>(&self) -> Option<S> {
        if !self.path.exists() {
            return None;
        }

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "snapshot unreadable, starting from empty state"
                );
                return None;
            },
        };

        match bincode::deserialize(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "snapshot corrupt, starting from empty state"
                );
                None
            },
        }
    }
}
