//! Counters for protocol observability.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics kept by the coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Commits started.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted.
    pub aborted: AtomicU64,
    /// Transactions aborted by the PREPARE deadline.
    pub timed_out: AtomicU64,
    /// Decision messages re-sent by the heartbeat.
    pub resends: AtomicU64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of started transactions that committed.
    pub fn commit_rate(&self) -> f64 {
        let started = self.started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        self.committed.load(Ordering::Relaxed) as f64 / started as f64
    }
}

/// Statistics kept by a participant.
#[derive(Debug, Default)]
pub struct ParticipantStats {
    /// PREPARE messages received.
    pub prepares: AtomicU64,
    /// YES votes sent.
    pub yes_votes: AtomicU64,
    /// NO votes sent.
    pub no_votes: AtomicU64,
    /// Commits applied locally.
    pub commits_applied: AtomicU64,
    /// Aborts that released local state.
    pub aborts_applied: AtomicU64,
}

impl ParticipantStats {
    pub fn new() -> Self {
        Self::default()
    }
}
