//! Wire messages for the two-phase collage commit protocol.
//!
//! The five tags map onto a single tagged enum with one decode step at the
//! receive boundary. Encoding is bincode; the transport treats payloads as
//! opaque bytes.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque routable participant address.
pub type NodeId = String;

/// Transaction identifier, unique per coordinator lifetime.
pub type TxnId = String;

/// Protocol message exchanged between coordinator and participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request votes for a collage commit (coordinator -> participant).
    Prepare(PrepareMsg),
    /// Vote on a prepared commit (participant -> coordinator).
    Vote(VoteMsg),
    /// Apply a decided commit (coordinator -> participant).
    Commit(CommitMsg),
    /// Roll back a decided abort (coordinator -> participant).
    Abort(AbortMsg),
    /// Acknowledge a commit or abort (participant -> coordinator).
    Ack(AckMsg),
}

/// Prepare request carrying the proposed composite and the source files
/// requested from the addressed participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareMsg {
    /// Transaction identifier.
    pub txn_id: TxnId,
    /// Composite image payload.
    pub composite: Vec<u8>,
    /// Source filenames requested from this participant.
    pub sources: Vec<String>,
}

/// Vote from a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteMsg {
    /// Transaction identifier.
    pub txn_id: TxnId,
    /// True for YES, false for NO.
    pub vote: bool,
}

/// Commit order for a decided transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMsg {
    /// Transaction identifier.
    pub txn_id: TxnId,
}

/// Abort order for a decided transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortMsg {
    /// Transaction identifier.
    pub txn_id: TxnId,
}

/// Acknowledgment of an applied decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMsg {
    /// Transaction identifier.
    pub txn_id: TxnId,
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Prepare(_) => "Prepare",
            Message::Vote(_) => "Vote",
            Message::Commit(_) => "Commit",
            Message::Abort(_) => "Abort",
            Message::Ack(_) => "Ack",
        }
    }

    /// The transaction this message belongs to.
    pub fn txn_id(&self) -> &TxnId {
        match self {
            Message::Prepare(m) => &m.txn_id,
            Message::Vote(m) => &m.txn_id,
            Message::Commit(m) => &m.txn_id,
            Message::Abort(m) => &m.txn_id,
            Message::Ack(m) => &m.txn_id,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire. One decode step at the receive boundary; an
    /// unrecognized payload surfaces as a serialization error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
