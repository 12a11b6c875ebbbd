// SPDX-License-Identifier: MIT OR Apache-2.0
//! Participant-side source ledger: promised transactions and file locks.
//!
//! Two coupled maps make up the whole persistent participant state:
//! - `active`: transaction id -> source filenames promised to it
//! - `locked`: source filename -> transaction id holding it
//!
//! A filename appears in `locked` iff it appears in some `active` list with
//! a matching transaction id, and a filename is held by at most one
//! transaction. Both maps are mutated together under the participant's
//! state lock so the snapshot on disk is always internally consistent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::TxnId;

/// The participant's promise and lock tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceLocks {
    /// Active transactions and the files promised to each.
    active: HashMap<TxnId, Vec<String>>,
    /// Locked files and the transaction holding each.
    locked: HashMap<String, TxnId>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a YES vote has been recorded for this transaction.
    pub fn is_promised(&self, txn_id: &str) -> bool {
        self.active.contains_key(txn_id)
    }

    /// The files promised to a transaction, if any.
    pub fn promised_sources(&self, txn_id: &str) -> Option<&[String]> {
        self.active.get(txn_id).map(Vec::as_slice)
    }

    /// The transaction currently holding a file.
    pub fn holder(&self, file: &str) -> Option<&TxnId> {
        self.locked.get(file)
    }

    /// Whether a file is held by a *different* transaction. A file locked by
    /// the same transaction is treated as held, so re-delivered PREPAREs
    /// stay idempotent.
    pub fn conflicts(&self, txn_id: &str, file: &str) -> bool {
        self.locked.get(file).is_some_and(|holder| holder != txn_id)
    }

    /// Record a promise: lock every file for the transaction and remember
    /// the list. The caller has already checked for conflicts.
    pub fn reserve(&mut self, txn_id: &str, files: &[String]) {
        for file in files {
            self.locked.insert(file.clone(), txn_id.to_string());
        }
        self.active.insert(txn_id.to_string(), files.to_vec());
    }

    /// Release the locks held by a transaction (iff each lock still maps to
    /// it) and drop the promise. Returns false when the transaction was
    /// unknown, so callers can skip a redundant flush.
    pub fn release(&mut self, txn_id: &str) -> bool {
        let Some(files) = self.active.remove(txn_id) else {
            return false;
        };
        for file in &files {
            if self.locked.get(file).is_some_and(|holder| holder == txn_id) {
                self.locked.remove(file);
            }
        }
        true
    }

    /// Remove a promise and its locks, handing back the files so the caller
    /// can delete them. `None` means the commit was already applied (or the
    /// transaction was never known here).
    pub fn take_promised(&mut self, txn_id: &str) -> Option<Vec<String>> {
        let files = self.active.remove(txn_id)?;
        for file in &files {
            if self.locked.get(file).is_some_and(|holder| holder == txn_id) {
                self.locked.remove(file);
            }
        }
        Some(files)
    }

    /// Number of locked files.
    pub fn locked_count(&self) -> usize {
        self.locked.len()
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
