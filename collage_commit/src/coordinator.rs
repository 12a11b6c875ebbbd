//! Coordinator side of the two-phase collage commit protocol.
//!
//! Drives each commit through PREPARING -> COMMITTING/ABORTING ->
//! COMMITTED/ABORTED:
//! - Phase 1 (PREPARE): fan out the proposed composite, collect votes
//! - Phase 2 (COMMIT/ABORT): disseminate the decision until acknowledged
//!
//! The transaction table is a concurrent map; every read-modify-write of a
//! single record, including the associated log flush, runs under that
//! record's guard. The snapshot writer itself never takes guards, records
//! are only mutated in short shard-locked critical sections, so flushing
//! can never deadlock against a handler.
//!
//! ## Critical Invariants
//!
//! 1. COMMITTING is entered only on unanimous YES votes
//! 2. A single NO vote is final; the transaction aborts
//! 3. The composite is written exactly once, after COMMITTING is durable
//!    (log-then-write; recovery re-runs the idempotent write)
//! 4. Undecided transactions found at startup are forced to abort

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::message::{AbortMsg, AckMsg, CommitMsg, Message, NodeId, PrepareMsg, TxnId, VoteMsg};
use crate::retry::{TimerEvent, TimerWheel};
use crate::snapshot::SnapshotStore;
use crate::stats::CoordinatorStats;
use crate::storage::ImageStore;
use crate::transport::Transport;

/// State of a coordinator-side transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Record created, nothing sent yet.
    Init,
    /// PREPARE sent, collecting votes.
    Preparing,
    /// Unanimous YES; composite written; COMMIT being disseminated.
    Committing,
    /// A NO vote or the deadline decided against the commit.
    Aborting,
    /// Every participant acknowledged the commit.
    Committed,
    /// Every participant acknowledged the abort.
    Aborted,
}

impl TxnState {
    /// Whether the transaction has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    /// Whether a decision is being disseminated.
    pub fn is_decided(self) -> bool {
        matches!(self, TxnState::Committing | TxnState::Aborting)
    }
}

/// One collage commit tracked by the coordinator. Records are kept
/// indefinitely, in memory and in the snapshot log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
    /// Transaction identifier.
    pub id: TxnId,
    /// Destination path of the composite image, relative to the image dir.
    pub filename: String,
    /// Composite image payload.
    pub composite: Vec<u8>,
    /// Participant address -> ordered source filenames requested from it.
    pub participant_sources: HashMap<NodeId, Vec<String>>,
    /// Current state.
    pub state: TxnState,
    /// Participants that voted YES.
    pub votes_received: HashSet<NodeId>,
    /// Participants whose decision acknowledgement is outstanding.
    pub ack_pending: HashSet<NodeId>,
}

impl TxnRecord {
    fn new(
        id: TxnId,
        filename: String,
        composite: Vec<u8>,
        participant_sources: HashMap<NodeId, Vec<String>>,
    ) -> Self {
        let ack_pending = participant_sources.keys().cloned().collect();
        Self {
            id,
            filename,
            composite,
            participant_sources,
            state: TxnState::Init,
            votes_received: HashSet::new(),
            ack_pending,
        }
    }

    /// The participant set of the transaction.
    pub fn participants(&self) -> impl Iterator<Item = &NodeId> {
        self.participant_sources.keys()
    }

    fn record_vote(&mut self, from: &NodeId, vote: bool) {
        if !vote {
            self.state = TxnState::Aborting;
            return;
        }
        if self.participant_sources.contains_key(from) {
            self.votes_received.insert(from.clone());
        }
        if self.votes_received.len() == self.participant_sources.len() {
            self.state = TxnState::Committing;
        }
    }

    fn record_ack(&mut self, from: &NodeId) {
        self.ack_pending.remove(from);
        if !self.ack_pending.is_empty() {
            return;
        }
        match self.state {
            TxnState::Committing => self.state = TxnState::Committed,
            TxnState::Aborting => self.state = TxnState::Aborted,
            _ => {},
        }
    }
}

/// Everything the coordinator persists: the transaction table and the id
/// counter it allocates from.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CoordinatorSnapshot {
    transactions: HashMap<TxnId, TxnRecord>,
    next_txn: u64,
}

/// Coordinator for collage commits.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    images: ImageStore,
    log: SnapshotStore,
    transactions: DashMap<TxnId, TxnRecord>,
    /// Per-transaction guards; held across a record's read-modify-write and
    /// the associated flush.
    guards: DashMap<TxnId, Arc<Mutex<()>>>,
    /// Serializes snapshot capture+write so the on-disk state never
    /// regresses behind what a peer has been told.
    flush_lock: Mutex<()>,
    next_txn: AtomicU64,
    timers: Arc<TimerWheel>,
    /// Statistics.
    pub stats: CoordinatorStats,
}

impl Coordinator {
    /// Create a coordinator, replaying the snapshot log if one exists.
    /// Recovery forces undecided transactions to abort and re-runs the
    /// composite write for transactions already logged as COMMITTING.
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let log = SnapshotStore::new(&config.log_path);
        let images = ImageStore::new(&config.image_dir);
        let snapshot: CoordinatorSnapshot = log.load().unwrap_or_default();

        let coordinator = Self {
            config,
            transport,
            images,
            log,
            transactions: snapshot.transactions.into_iter().collect(),
            guards: DashMap::new(),
            flush_lock: Mutex::new(()),
            next_txn: AtomicU64::new(snapshot.next_txn),
            timers: Arc::new(TimerWheel::new()),
            stats: CoordinatorStats::new(),
        };
        coordinator.recover()?;
        Ok(coordinator)
    }

    /// Begin a collage commit. Entry point for the upstream originator.
    ///
    /// Sources are `<participant>:<filename>` references; a malformed
    /// reference is logged and skipped without rejecting the remainder.
    /// The new record is durable before the first PREPARE leaves.
    pub fn start_commit(
        &self,
        filename: &str,
        composite: Vec<u8>,
        sources: &[String],
    ) -> Result<TxnId> {
        let txn_id = self.next_txn.fetch_add(1, Ordering::SeqCst).to_string();

        let mut grouped: HashMap<NodeId, Vec<String>> = HashMap::new();
        for source in sources {
            match source.split_once(':') {
                Some((node, file)) if !node.is_empty() && !file.is_empty() => {
                    grouped
                        .entry(node.to_string())
                        .or_default()
                        .push(file.to_string());
                },
                _ => tracing::warn!(source = %source, "skipping malformed source reference"),
            }
        }

        if grouped.len() > self.config.max_participants {
            tracing::warn!(
                participants = grouped.len(),
                cap = self.config.max_participants,
                "participant set exceeds the configured cap"
            );
        }

        let mut record = TxnRecord::new(txn_id.clone(), filename.to_string(), composite, grouped);
        record.state = TxnState::Preparing;
        let no_participants = record.participant_sources.is_empty();
        let prepares: Vec<(NodeId, Message)> = record
            .participant_sources
            .iter()
            .map(|(node, files)| {
                let msg = Message::Prepare(PrepareMsg {
                    txn_id: txn_id.clone(),
                    composite: record.composite.clone(),
                    sources: files.clone(),
                });
                (node.clone(), msg)
            })
            .collect();

        let guard = self.guard_for(&txn_id);
        let _held = guard.lock();
        self.transactions.insert(txn_id.clone(), record);
        self.stats.started.fetch_add(1, Ordering::Relaxed);

        if no_participants {
            // Vacuous unanimity: no votes to wait for, decide at once.
            let Some((file, bytes)) = self.transactions.get_mut(&txn_id).map(|mut record| {
                record.state = TxnState::Committing;
                (record.filename.clone(), record.composite.clone())
            }) else {
                return Ok(txn_id);
            };
            self.flush()?;
            self.images.write_atomic(&file, &bytes)?;
            if let Some(mut record) = self.transactions.get_mut(&txn_id) {
                record.state = TxnState::Committed;
            }
            self.flush()?;
            self.stats.committed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(txn_id = %txn_id, file = %filename, "commit with no participants applied immediately");
            return Ok(txn_id);
        }

        self.flush()?;
        for (node, msg) in prepares {
            if let Err(e) = self.transport.send(&node, msg) {
                tracing::debug!(txn_id = %txn_id, to = %node, error = %e, "prepare send failed");
            }
        }
        self.timers.schedule_in(
            self.config.prepare_timeout,
            TimerEvent::PrepareDeadline {
                txn_id: txn_id.clone(),
            },
        );
        tracing::info!(txn_id = %txn_id, file = %filename, "commit started");
        Ok(txn_id)
    }

    /// Handle a VOTE. Votes outside PREPARING are ignored silently; a late
    /// YES after an abort decision is a no-op.
    pub fn handle_vote(&self, from: &NodeId, msg: &VoteMsg) -> Result<()> {
        if !self.transactions.contains_key(&msg.txn_id) {
            tracing::debug!(txn_id = %msg.txn_id, from = %from, "vote for unknown transaction ignored");
            return Ok(());
        }
        let guard = self.guard_for(&msg.txn_id);
        let _held = guard.lock();

        let decision = {
            let Some(mut record) = self.transactions.get_mut(&msg.txn_id) else {
                return Ok(());
            };
            if record.state != TxnState::Preparing {
                tracing::debug!(
                    txn_id = %msg.txn_id,
                    state = ?record.state,
                    "vote outside PREPARING ignored"
                );
                return Ok(());
            }
            record.record_vote(from, msg.vote);
            if record.state == TxnState::Committing {
                Some((true, record.filename.clone(), record.composite.clone()))
            } else if record.state == TxnState::Aborting {
                Some((false, String::new(), Vec::new()))
            } else {
                None
            }
        };

        match decision {
            Some((true, file, bytes)) => {
                // COMMITTING must be durable before the composite exists on
                // disk; a crash in between re-runs the idempotent write.
                self.flush()?;
                self.images.write_atomic(&file, &bytes)?;
                tracing::info!(txn_id = %msg.txn_id, file = %file, "unanimous YES, composite written");
                self.broadcast_decision(&msg.txn_id, false);
            },
            Some((false, _, _)) => {
                self.flush()?;
                tracing::info!(txn_id = %msg.txn_id, from = %from, "NO vote, aborting");
                self.broadcast_decision(&msg.txn_id, false);
            },
            None => self.flush()?,
        }
        Ok(())
    }

    /// Handle an ACK. Duplicate acks are idempotent; when the last one
    /// arrives the transaction reaches its terminal state.
    pub fn handle_ack(&self, from: &NodeId, msg: &AckMsg) -> Result<()> {
        if !self.transactions.contains_key(&msg.txn_id) {
            tracing::debug!(txn_id = %msg.txn_id, from = %from, "ack for unknown transaction ignored");
            return Ok(());
        }
        let guard = self.guard_for(&msg.txn_id);
        let _held = guard.lock();

        let terminal = {
            let Some(mut record) = self.transactions.get_mut(&msg.txn_id) else {
                return Ok(());
            };
            let before = record.state;
            record.record_ack(from);
            (record.state != before && record.state.is_terminal()).then_some(record.state)
        };
        self.flush()?;

        match terminal {
            Some(TxnState::Committed) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(txn_id = %msg.txn_id, "transaction committed");
            },
            Some(TxnState::Aborted) => {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(txn_id = %msg.txn_id, "transaction aborted");
            },
            _ => {},
        }
        Ok(())
    }

    /// Abort a transaction whose PREPARE deadline elapsed while still
    /// undecided. Called by the retry engine; stale events are no-ops.
    pub fn expire_prepare(&self, txn_id: &TxnId) -> Result<()> {
        if !self.transactions.contains_key(txn_id) {
            return Ok(());
        }
        let guard = self.guard_for(txn_id);
        let _held = guard.lock();

        let expired = {
            let Some(mut record) = self.transactions.get_mut(txn_id) else {
                return Ok(());
            };
            if record.state == TxnState::Preparing {
                record.state = TxnState::Aborting;
                true
            } else {
                false
            }
        };
        if expired {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            self.flush()?;
            tracing::warn!(txn_id = %txn_id, "PREPARE deadline elapsed, aborting");
            self.broadcast_decision(txn_id, false);
        }
        Ok(())
    }

    /// Re-send COMMIT/ABORT for every transaction still disseminating a
    /// decision. Terminal transactions fall out of the filter, which is what
    /// cancels their retries.
    pub fn sweep_decisions(&self) {
        let decided: Vec<TxnId> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().state.is_decided())
            .map(|entry| entry.key().clone())
            .collect();

        for txn_id in decided {
            let guard = self.guard_for(&txn_id);
            let _held = guard.lock();
            self.broadcast_decision(&txn_id, true);
        }
    }

    /// Route one inbound message. Unknown tags are logged and dropped.
    pub fn dispatch(&self, from: &NodeId, msg: Message) {
        match msg {
            Message::Vote(vote) => {
                if let Err(e) = self.handle_vote(from, &vote) {
                    tracing::error!(txn_id = %vote.txn_id, error = %e, "vote handling failed");
                }
            },
            Message::Ack(ack) => {
                if let Err(e) = self.handle_ack(from, &ack) {
                    tracing::error!(txn_id = %ack.txn_id, error = %e, "ack handling failed");
                }
            },
            other => {
                tracing::warn!(from = %from, kind = other.type_name(), "unexpected message at coordinator");
            },
        }
    }

    /// Blocking dispatch loop; returns when the transport shuts down.
    pub fn run(&self) {
        while let Ok((from, msg)) = self.transport.recv() {
            self.dispatch(&from, msg);
        }
    }

    /// Get a copy of a transaction record.
    pub fn get(&self, txn_id: &str) -> Option<TxnRecord> {
        self.transactions.get(txn_id).map(|r| r.value().clone())
    }

    /// Number of tracked transactions, terminal ones included.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The timer wheel shared with the retry engine.
    pub fn timers(&self) -> Arc<TimerWheel> {
        Arc::clone(&self.timers)
    }

    fn guard_for(&self, txn_id: &str) -> Arc<Mutex<()>> {
        let entry = self.guards.entry(txn_id.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Send the current decision to every participant still in
    /// `ack_pending`. Callers hold the transaction's guard.
    fn broadcast_decision(&self, txn_id: &TxnId, resend: bool) {
        let Some((state, pending)) = self.transactions.get(txn_id).map(|record| {
            (
                record.state,
                record.ack_pending.iter().cloned().collect::<Vec<_>>(),
            )
        }) else {
            return;
        };
        if !state.is_decided() {
            return;
        }

        for node in pending {
            let msg = if state == TxnState::Committing {
                Message::Commit(CommitMsg {
                    txn_id: txn_id.clone(),
                })
            } else {
                Message::Abort(AbortMsg {
                    txn_id: txn_id.clone(),
                })
            };
            if resend {
                self.stats.resends.fetch_add(1, Ordering::Relaxed);
            }
            if let Err(e) = self.transport.send(&node, msg) {
                tracing::debug!(txn_id = %txn_id, to = %node, error = %e, "decision send failed");
            }
        }
    }

    /// Serialize the whole table plus the id counter and flush it. Capture
    /// and write happen under one lock; guards are never taken here.
    fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        let snapshot = CoordinatorSnapshot {
            transactions: self
                .transactions
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            next_txn: self.next_txn.load(Ordering::SeqCst),
        };
        self.log.persist(&snapshot)
    }

    fn recover(&self) -> Result<()> {
        let ids: Vec<TxnId> = self
            .transactions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut changed = false;
        for txn_id in ids {
            let rewrite = {
                let Some(mut record) = self.transactions.get_mut(&txn_id) else {
                    continue;
                };
                match record.state {
                    TxnState::Init | TxnState::Preparing => {
                        // In-flight votes may be lost; the conservative
                        // decision is to abort and let the sweep drive the
                        // ABORT to termination.
                        record.state = TxnState::Aborting;
                        changed = true;
                        tracing::info!(txn_id = %txn_id, "undecided transaction forced to abort on recovery");
                        None
                    },
                    TxnState::Committing => {
                        Some((record.filename.clone(), record.composite.clone()))
                    },
                    _ => None,
                }
            };
            if let Some((file, bytes)) = rewrite {
                self.images.write_atomic(&file, &bytes)?;
                tracing::info!(txn_id = %txn_id, file = %file, "composite re-written during recovery");
            }
        }

        if changed {
            self.flush()?;
        }
        Ok(())
    }
}
