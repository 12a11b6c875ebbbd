//! Configuration for the coordinator and participant roles.

use std::path::PathBuf;
use std::time::Duration;

use crate::message::NodeId;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a transaction may sit in PREPARING before it is aborted.
    pub prepare_timeout: Duration,
    /// Period of the decision heartbeat that re-sends COMMIT/ABORT to
    /// participants with outstanding acknowledgements.
    pub resend_interval: Duration,
    /// Durable snapshot log path.
    pub log_path: PathBuf,
    /// Directory composite images are written into.
    pub image_dir: PathBuf,
    /// Operational cap on the participant set; exceeding it only logs a
    /// warning, the protocol is correct for any bounded count.
    pub max_participants: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(3),
            resend_interval: Duration::from_secs(1),
            log_path: PathBuf::from("server_log.dat"),
            image_dir: PathBuf::from("."),
            max_participants: 4,
        }
    }
}

impl CoordinatorConfig {
    /// Set the PREPARE deadline.
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    /// Set the decision heartbeat period.
    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    /// Set the snapshot log path.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Set the composite image directory.
    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }
}

/// Configuration for a participant node.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// This node's address.
    pub node_id: NodeId,
    /// Durable snapshot log path, `usernode_<id>_log.dat` by default.
    pub log_path: PathBuf,
    /// Directory the node's source images live in.
    pub image_dir: PathBuf,
}

impl ParticipantConfig {
    /// Create a config for the given node id with default paths.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let log_path = PathBuf::from(format!("usernode_{}_log.dat", node_id));
        Self {
            node_id,
            log_path,
            image_dir: PathBuf::from("."),
        }
    }

    /// Set the snapshot log path.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Set the source image directory.
    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }
}
