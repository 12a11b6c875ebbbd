//! Participant side of the two-phase collage commit protocol.
//!
//! On PREPARE: validate the requested sources, prompt the local user, lock
//! and promise on approval, vote. On COMMIT: delete the promised sources
//! and acknowledge. On ABORT: release and acknowledge. Both decision
//! handlers are idempotent so replayed decisions keep an at-most-once
//! global effect.
//!
//! The two state maps live behind one coarse lock; participant traffic for
//! a single node is not highly concurrent and the coarse lock keeps
//! crash-consistency straightforward. The user prompt is the one blocking
//! call made *outside* that lock, with the conflict checks re-run after it
//! returns.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::config::ParticipantConfig;
use crate::locks::SourceLocks;
use crate::message::{AbortMsg, AckMsg, CommitMsg, Message, NodeId, PrepareMsg, TxnId, VoteMsg};
use crate::snapshot::SnapshotStore;
use crate::stats::ParticipantStats;
use crate::storage::ImageStore;
use crate::transport::Transport;

/// Local user-approval oracle. The prompt blocks and may take arbitrarily
/// long; the participant calls it without holding its state lock.
pub trait Approval: Send + Sync {
    /// Does the local user approve contributing `sources` to `composite`?
    fn ask_user(&self, composite: &[u8], sources: &[String]) -> bool;
}

/// Oracle that approves everything. Useful default for tests and tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl Approval for AutoApprove {
    fn ask_user(&self, _composite: &[u8], _sources: &[String]) -> bool {
        true
    }
}

/// A participant node owning a local filesystem of source images.
pub struct Participant {
    config: ParticipantConfig,
    transport: Arc<dyn Transport>,
    approval: Arc<dyn Approval>,
    images: ImageStore,
    log: SnapshotStore,
    state: Mutex<SourceLocks>,
    /// Statistics.
    pub stats: ParticipantStats,
}

impl Participant {
    /// Create a participant, replaying its snapshot log if one exists.
    /// Locks and promises recorded before a crash are restored; the
    /// coordinator's retried decision resolves them.
    pub fn new(
        config: ParticipantConfig,
        transport: Arc<dyn Transport>,
        approval: Arc<dyn Approval>,
    ) -> Self {
        let log = SnapshotStore::new(&config.log_path);
        let images = ImageStore::new(&config.image_dir);
        let state = log.load().unwrap_or_default();

        Self {
            config,
            transport,
            approval,
            images,
            log,
            state: Mutex::new(state),
            stats: ParticipantStats::new(),
        }
    }

    /// Handle one inbound message. Returns true if the message was
    /// recognized and consumed.
    pub fn deliver_message(&self, from: &NodeId, msg: Message) -> bool {
        match msg {
            Message::Prepare(prepare) => {
                self.handle_prepare(from, prepare);
                true
            },
            Message::Commit(commit) => {
                self.handle_commit(from, &commit);
                true
            },
            Message::Abort(abort) => {
                self.handle_abort(from, &abort);
                true
            },
            other => {
                tracing::warn!(
                    node_id = %self.config.node_id,
                    from = %from,
                    kind = other.type_name(),
                    "unexpected message at participant"
                );
                false
            },
        }
    }

    /// Blocking dispatch loop; returns when the transport shuts down.
    pub fn run(&self) {
        while let Ok((from, msg)) = self.transport.recv() {
            self.deliver_message(&from, msg);
        }
    }

    fn handle_prepare(&self, from: &NodeId, msg: PrepareMsg) {
        self.stats.prepares.fetch_add(1, Ordering::Relaxed);
        let txn_id = &msg.txn_id;

        // Validation under the state lock. A promise already on record
        // means this PREPARE is a re-delivery: answer YES again without
        // re-prompting the user.
        {
            let state = self.state.lock();
            if state.is_promised(txn_id) {
                drop(state);
                tracing::debug!(
                    node_id = %self.config.node_id,
                    txn_id = %txn_id,
                    "re-delivered PREPARE answered from recorded promise"
                );
                self.send_vote(from, txn_id, true);
                return;
            }
            if let Some(reason) = self.refusal(&state, txn_id, &msg.sources) {
                drop(state);
                tracing::info!(
                    node_id = %self.config.node_id,
                    txn_id = %txn_id,
                    reason,
                    "voting NO without prompting"
                );
                self.vote_no(from, txn_id);
                return;
            }
        }

        // The blocking prompt runs without the lock so a slow user on one
        // transaction cannot stall commits and aborts of others.
        if !self.approval.ask_user(&msg.composite, &msg.sources) {
            tracing::info!(node_id = %self.config.node_id, txn_id = %txn_id, "user rejected collage");
            self.vote_no(from, txn_id);
            return;
        }

        // Re-validate: sources may have been locked or deleted while the
        // prompt was open. Promise and flush in one critical section so the
        // on-disk state covers the YES before it is sent.
        let promised = {
            let mut state = self.state.lock();
            if self.refusal(&state, txn_id, &msg.sources).is_some() {
                false
            } else {
                state.reserve(txn_id, &msg.sources);
                match self.log.persist(&*state) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            node_id = %self.config.node_id,
                            txn_id = %txn_id,
                            error = %e,
                            "failed to persist promise, voting NO"
                        );
                        state.release(txn_id);
                        false
                    },
                }
            }
        };

        if promised {
            self.stats.yes_votes.fetch_add(1, Ordering::Relaxed);
            tracing::info!(node_id = %self.config.node_id, txn_id = %txn_id, "voting YES");
            self.send_vote(from, txn_id, true);
        } else {
            self.vote_no(from, txn_id);
        }
    }

    /// Why a PREPARE cannot be promised, if any reason exists.
    fn refusal(
        &self,
        state: &SourceLocks,
        txn_id: &str,
        sources: &[String],
    ) -> Option<&'static str> {
        for file in sources {
            if state.conflicts(txn_id, file) {
                return Some("source locked by another transaction");
            }
            if !self.images.contains(file) {
                return Some("source file missing");
            }
        }
        None
    }

    fn handle_commit(&self, from: &NodeId, msg: &CommitMsg) {
        {
            let mut state = self.state.lock();
            match state.take_promised(&msg.txn_id) {
                None => {
                    // Already applied, or never known here. Re-sending the
                    // ACK preserves the at-most-once effect under retries.
                    tracing::debug!(
                        node_id = %self.config.node_id,
                        txn_id = %msg.txn_id,
                        "COMMIT without active promise, acknowledging only"
                    );
                },
                Some(files) => {
                    for file in &files {
                        if let Err(e) = self.images.delete(file) {
                            tracing::error!(
                                node_id = %self.config.node_id,
                                txn_id = %msg.txn_id,
                                file = %file,
                                error = %e,
                                "failed to delete source"
                            );
                        }
                    }
                    if let Err(e) = self.log.persist(&*state) {
                        tracing::error!(
                            node_id = %self.config.node_id,
                            txn_id = %msg.txn_id,
                            error = %e,
                            "failed to persist commit"
                        );
                    }
                    self.stats.commits_applied.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        node_id = %self.config.node_id,
                        txn_id = %msg.txn_id,
                        sources = files.len(),
                        "commit applied, sources deleted"
                    );
                },
            }
        }
        self.send_ack(from, &msg.txn_id);
    }

    fn handle_abort(&self, from: &NodeId, msg: &AbortMsg) {
        self.release(&msg.txn_id);
        self.send_ack(from, &msg.txn_id);
    }

    /// Release the locks held for a transaction and drop its promise.
    /// An unknown transaction is acknowledged without any state change.
    fn release(&self, txn_id: &TxnId) {
        let mut state = self.state.lock();
        if state.release(txn_id) {
            if let Err(e) = self.log.persist(&*state) {
                tracing::error!(
                    node_id = %self.config.node_id,
                    txn_id = %txn_id,
                    error = %e,
                    "failed to persist abort"
                );
            }
            self.stats.aborts_applied.fetch_add(1, Ordering::Relaxed);
            tracing::info!(node_id = %self.config.node_id, txn_id = %txn_id, "abort applied, locks released");
        }
    }

    /// Vote NO, releasing any locks the transaction might already hold.
    fn vote_no(&self, to: &NodeId, txn_id: &TxnId) {
        self.release(txn_id);
        self.stats.no_votes.fetch_add(1, Ordering::Relaxed);
        self.send_vote(to, txn_id, false);
    }

    fn send_vote(&self, to: &NodeId, txn_id: &TxnId, vote: bool) {
        let msg = Message::Vote(VoteMsg {
            txn_id: txn_id.clone(),
            vote,
        });
        if let Err(e) = self.transport.send(to, msg) {
            tracing::debug!(node_id = %self.config.node_id, to = %to, error = %e, "vote send failed");
        }
    }

    fn send_ack(&self, to: &NodeId, txn_id: &TxnId) {
        let msg = Message::Ack(AckMsg {
            txn_id: txn_id.clone(),
        });
        if let Err(e) = self.transport.send(to, msg) {
            tracing::debug!(node_id = %self.config.node_id, to = %to, error = %e, "ack send failed");
        }
    }

    /// Whether a YES vote is on record for this transaction.
    pub fn is_promised(&self, txn_id: &str) -> bool {
        self.state.lock().is_promised(txn_id)
    }

    /// Number of locked source files.
    pub fn locked_count(&self) -> usize {
        self.state.lock().locked_count()
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.state.lock().active_count()
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }
}
