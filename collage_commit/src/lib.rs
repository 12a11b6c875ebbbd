//! Distributed atomic commit of image collages.
//!
//! A coordinator and a bounded set of participants decide, via two-phase
//! commit, whether a proposed composite image should be created from source
//! images held on the participants. A commit succeeds only when every
//! owning participant locks its sources and obtains local user approval;
//! only after the coordinator durably writes the composite are the
//! contributed sources deleted.
//!
//! # Architecture
//!
//! ```text
//! collage_commit
//!   ├── Coordinator (transaction table, vote/ack handlers, decision sweep)
//!   ├── Participant (source locks, user-approval oracle, idempotent apply)
//!   ├── SnapshotStore (durable full-state log, replayed at startup)
//!   ├── RetryEngine (min-heap timer wheel: PREPARE deadline + heartbeat)
//!   └── Transport (memory transport for tests, TCP for the daemons)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use collage_commit::{Coordinator, CoordinatorConfig, RetryEngine};
//!
//! let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default(), transport)?);
//! let _retry = RetryEngine::start(Arc::clone(&coordinator));
//!
//! coordinator.start_commit("out.jpg", composite_bytes, &sources)?;
//! coordinator.run();
//! ```

pub mod atomic_io;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod locks;
pub mod message;
pub mod participant;
pub mod retry;
pub mod snapshot;
pub mod stats;
pub mod storage;
pub mod tcp;
pub mod transport;

// Re-exports
pub use config::{CoordinatorConfig, ParticipantConfig};
pub use coordinator::{Coordinator, TxnRecord, TxnState};
pub use error::{CommitError, Result};
pub use locks::SourceLocks;
pub use message::{AbortMsg, AckMsg, CommitMsg, Message, NodeId, PrepareMsg, TxnId, VoteMsg};
pub use participant::{Approval, AutoApprove, Participant};
pub use retry::{RetryEngine, TimerEvent, TimerWheel};
pub use snapshot::SnapshotStore;
pub use stats::{CoordinatorStats, ParticipantStats};
pub use storage::ImageStore;
pub use tcp::{parse_peer_table, TcpTransport, TcpTransportConfig};
pub use transport::{MemoryHub, MemoryTransport, Transport};
