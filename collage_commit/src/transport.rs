//! Message transport abstraction.
//!
//! Provides a pluggable transport layer for coordinator/participant
//! communication:
//! - `Transport` trait defines the interface
//! - `MemoryTransport` for testing, with partition and message-drop injection
//!
//! Delivery is best-effort: messages may be dropped or duplicated and no
//! ordering is guaranteed. Reliability is the retry engine's job, so send
//! failures are swallowed by callers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{CommitError, Result};
use crate::message::{Message, NodeId};

/// Blocking transport for protocol messages.
pub trait Transport: Send + Sync {
    /// Send a message to a peer. Best-effort; an error means the message was
    /// not handed to the network, and callers treat both outcomes the same.
    fn send(&self, to: &NodeId, msg: Message) -> Result<()>;

    /// Block until a message arrives. Returns `ChannelClosed` when the
    /// transport has shut down.
    fn recv(&self) -> Result<(NodeId, Message)>;

    /// This node's address.
    fn local_id(&self) -> &NodeId;
}

type Mailbox = Sender<(NodeId, Message)>;

/// Shared routing table for a set of in-process `MemoryTransport`s.
#[derive(Default)]
pub struct MemoryHub {
    mailboxes: RwLock<HashMap<NodeId, Mailbox>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and hand back its transport endpoint.
    pub fn register(self: &Arc<Self>, id: impl Into<NodeId>) -> MemoryTransport {
        let id = id.into();
        let (tx, rx) = unbounded();
        self.mailboxes.write().insert(id.clone(), tx);
        MemoryTransport {
            local_id: id,
            hub: Arc::clone(self),
            receiver: rx,
            partitioned: RwLock::new(HashSet::new()),
            drop_filters: Mutex::new(HashMap::new()),
            duplicate_filters: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Remove a node's mailbox. Its dispatcher observes `ChannelClosed` once
    /// the queue drains.
    pub fn unregister(&self, id: &NodeId) {
        self.mailboxes.write().remove(id);
    }

    fn mailbox(&self, id: &NodeId) -> Option<Mailbox> {
        self.mailboxes.read().get(id).cloned()
    }
}

/// In-memory transport for testing with fault injection support.
pub struct MemoryTransport {
    local_id: NodeId,
    hub: Arc<MemoryHub>,
    receiver: Receiver<(NodeId, Message)>,
    /// Peers this endpoint's sends are dropped toward.
    partitioned: RwLock<HashSet<NodeId>>,
    /// (peer, message tag) -> number of upcoming sends to drop silently.
    drop_filters: Mutex<HashMap<(NodeId, &'static str), u32>>,
    /// (peer, message tag) -> number of upcoming sends to deliver twice.
    duplicate_filters: Mutex<HashMap<(NodeId, &'static str), u32>>,
    dropped: AtomicU64,
}

impl MemoryTransport {
    /// Simulate a network partition toward a peer.
    pub fn partition(&self, peer: &NodeId) {
        tracing::info!(local_id = %self.local_id, peer = %peer, "network partition simulated");
        self.partitioned.write().insert(peer.clone());
    }

    /// Heal a partition.
    pub fn heal(&self, peer: &NodeId) {
        tracing::info!(local_id = %self.local_id, peer = %peer, "network partition healed");
        self.partitioned.write().remove(peer);
    }

    /// Silently drop the next `count` messages of the given tag sent to `peer`.
    pub fn drop_next(&self, peer: &NodeId, type_name: &'static str, count: u32) {
        *self
            .drop_filters
            .lock()
            .entry((peer.clone(), type_name))
            .or_insert(0) += count;
    }

    /// Deliver the next `count` messages of the given tag to `peer` twice.
    pub fn duplicate_next(&self, peer: &NodeId, type_name: &'static str, count: u32) {
        *self
            .duplicate_filters
            .lock()
            .entry((peer.clone(), type_name))
            .or_insert(0) += count;
    }

    /// Number of messages dropped by partitions and drop filters.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Receive with a timeout; test helper for inspecting traffic.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<(NodeId, Message)> {
        self.receiver
            .recv_timeout(timeout)
            .map_err(|_| CommitError::ChannelClosed)
    }

    fn take_filter(
        filters: &Mutex<HashMap<(NodeId, &'static str), u32>>,
        to: &NodeId,
        type_name: &'static str,
    ) -> bool {
        let mut filters = filters.lock();
        match filters.get_mut(&(to.clone(), type_name)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            },
            _ => false,
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: &NodeId, msg: Message) -> Result<()> {
        if self.partitioned.read().contains(to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(from = %self.local_id, to = %to, "message dropped: network partition");
            return Err(CommitError::Network(format!(
                "network partition: {} -> {}",
                self.local_id, to
            )));
        }

        if Self::take_filter(&self.drop_filters, to, msg.type_name()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                from = %self.local_id,
                to = %to,
                kind = msg.type_name(),
                "message dropped: drop filter"
            );
            return Ok(());
        }

        let Some(mailbox) = self.hub.mailbox(to) else {
            tracing::debug!(from = %self.local_id, to = %to, "send failed: peer not found");
            return Err(CommitError::Network(format!("peer not found: {}", to)));
        };

        let duplicate = Self::take_filter(&self.duplicate_filters, to, msg.type_name());
        if duplicate {
            mailbox
                .send((self.local_id.clone(), msg.clone()))
                .map_err(|e| CommitError::Network(e.to_string()))?;
        }

        mailbox
            .send((self.local_id.clone(), msg))
            .map_err(|e| CommitError::Network(e.to_string()))?;

        Ok(())
    }

    fn recv(&self) -> Result<(NodeId, Message)> {
        self.receiver.recv().map_err(|_| CommitError::ChannelClosed)
    }

    fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}
