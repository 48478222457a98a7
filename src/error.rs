//! Domain error types for the Arrakis shard orchestrator
//!
//! Three layers, mirroring how failures propagate:
//! - `ProtocolError`: frame/payload level, fatal to the connection it came from
//! - `TransportError`: a send or read on one connection failed
//! - `OrchestratorError`: returned synchronously to operator calls
//!
//! `NatsError` covers the optional roster publication on the side.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Event id is neither a control event nor a registered user event
    #[error("unknown event: {0}")]
    UnknownEvent(u32),

    /// User events must live at or above the reserved control range
    #[error("user event id {id} is reserved for control events (must be >= {min})")]
    ReservedEventId { id: u32, min: u32 },

    /// The same user event id was registered twice
    #[error("user event id {0} is already registered")]
    DuplicateUserEvent(u32),

    /// Frame body larger than the receiver accepts
    #[error("frame body of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Payload failed to serialize
    #[error("failed encoding payload for event {event}")]
    Encode {
        event: u32,
        #[source]
        source: rmp_serde::encode::Error,
    },

    /// Payload failed to deserialize
    #[error("failed decoding payload for event {event}")]
    Decode {
        event: u32,
        #[source]
        source: rmp_serde::decode::Error,
    },
}

/// Errors surfaced by a single framed connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection I/O failed")]
    Io(#[from] std::io::Error),

    /// The connection was closed before the write happened
    #[error("connection {0} is closed")]
    Closed(String),
}

/// Roster publication errors
#[derive(Error, Debug)]
pub enum NatsError {
    #[error("failed to connect to NATS")]
    Connect(#[from] async_nats::ConnectError),

    #[error("failed to publish roster")]
    Publish(#[from] async_nats::PublishError),

    #[error("failed to serialize roster")]
    Serialize(#[from] serde_json::Error),
}

/// Orchestrator domain errors
///
/// Validation variants (`UnknownFromNode` .. `NodeNotConnected`) are
/// returned before any state is mutated. The rest describe failures of
/// launches, waits and the shard count source.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown 'from' node")]
    UnknownFromNode,

    #[error("unknown 'to' node")]
    UnknownToNode,

    #[error("'from' node {node_id} not running shard {shard_id}")]
    FromNodeNotRunningShard { node_id: String, shard_id: u32 },

    /// One of the migration participants already has a migration role
    #[error("node {0} is busy")]
    NodeBusy(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("shard {0} already running")]
    ShardAlreadyRunning(u32),

    /// The node is known but its connection is down
    #[error("node {0} is not connected")]
    NodeNotConnected(String),

    #[error("no node launcher configured")]
    NoNodeLauncher,

    #[error("already performing a full migration")]
    FullMigrationInProgress,

    #[error("full migration was cancelled")]
    FullMigrationCancelled,

    #[error("no version updater configured")]
    NoVersionUpdater,

    #[error("pulling a new node version failed")]
    VersionPull(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// findAvailableNode gave up after repeated launches
    #[error("failed launching a usable node {attempts} times")]
    NodeLaunchExhausted { attempts: u32 },

    #[error("node launch failed")]
    NodeLaunch(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed resolving total shard count: {0}")]
    ShardCount(String),

    /// A node reported a total shard count different from the pinned one
    #[error("total shard count mismatch: node reported {reported}, pinned {pinned}")]
    TotalShardsMismatch { reported: u32, pinned: u32 },

    #[error("node speaks logic version {reported}, orchestrator requires {required}")]
    IncompatibleLogicVersion { reported: u32, required: u32 },

    #[error("timed out waiting for shard {shard_id} to migrate")]
    MigrationWaitTimedOut { shard_id: u32 },

    #[error("wait for shard {shard_id} migration was cancelled")]
    MigrationWaitCancelled { shard_id: u32 },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OrchestratorError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `orchestrator_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::UnknownFromNode => "unknown_from_node",
            Self::UnknownToNode => "unknown_to_node",
            Self::FromNodeNotRunningShard { .. } => "from_node_not_running_shard",
            Self::NodeBusy(_) => "node_busy",
            Self::UnknownNode(_) => "unknown_node",
            Self::ShardAlreadyRunning(_) => "shard_already_running",
            Self::NodeNotConnected(_) => "node_not_connected",
            Self::NoNodeLauncher => "no_node_launcher",
            Self::FullMigrationInProgress => "full_migration_in_progress",
            Self::FullMigrationCancelled => "full_migration_cancelled",
            Self::NoVersionUpdater => "no_version_updater",
            Self::VersionPull(_) => "version_pull",
            Self::NodeLaunchExhausted { .. } => "node_launch_exhausted",
            Self::NodeLaunch(_) => "node_launch",
            Self::ShardCount(_) => "shard_count",
            Self::TotalShardsMismatch { .. } => "total_shards_mismatch",
            Self::IncompatibleLogicVersion { .. } => "logic_version",
            Self::MigrationWaitTimedOut { .. } => "migration_wait_timeout",
            Self::MigrationWaitCancelled { .. } => "migration_wait_cancelled",
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
        }
    }

    /// True for errors caused by a bad operator request rather than the fleet.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownFromNode
                | Self::UnknownToNode
                | Self::FromNodeNotRunningShard { .. }
                | Self::NodeBusy(_)
                | Self::UnknownNode(_)
                | Self::ShardAlreadyRunning(_)
                | Self::NodeNotConnected(_)
                | Self::FullMigrationInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            OrchestratorError::UnknownFromNode.error_type_label(),
            OrchestratorError::UnknownToNode.error_type_label(),
            OrchestratorError::FromNodeNotRunningShard {
                node_id: "a".to_string(),
                shard_id: 1,
            }
            .error_type_label(),
            OrchestratorError::NodeBusy("a".to_string()).error_type_label(),
            OrchestratorError::UnknownNode("a".to_string()).error_type_label(),
            OrchestratorError::ShardAlreadyRunning(1).error_type_label(),
            OrchestratorError::NodeNotConnected("a".to_string()).error_type_label(),
            OrchestratorError::NoNodeLauncher.error_type_label(),
            OrchestratorError::FullMigrationInProgress.error_type_label(),
            OrchestratorError::FullMigrationCancelled.error_type_label(),
            OrchestratorError::NoVersionUpdater.error_type_label(),
            OrchestratorError::VersionPull(test_error()).error_type_label(),
            OrchestratorError::NodeLaunchExhausted { attempts: 5 }.error_type_label(),
            OrchestratorError::NodeLaunch(test_error()).error_type_label(),
            OrchestratorError::ShardCount("x".to_string()).error_type_label(),
            OrchestratorError::TotalShardsMismatch {
                reported: 1,
                pinned: 2,
            }
            .error_type_label(),
            OrchestratorError::IncompatibleLogicVersion {
                reported: 1,
                required: 2,
            }
            .error_type_label(),
            OrchestratorError::MigrationWaitTimedOut { shard_id: 1 }.error_type_label(),
            OrchestratorError::MigrationWaitCancelled { shard_id: 1 }.error_type_label(),
            OrchestratorError::Config("x".to_string()).error_type_label(),
            OrchestratorError::Transport(TransportError::Closed("a".to_string()))
                .error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn error_messages_contain_context() {
        let err = OrchestratorError::FromNodeNotRunningShard {
            node_id: "node-a".to_string(),
            shard_id: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("node-a"));
        assert!(msg.contains("shard 7"));

        let err = OrchestratorError::TotalShardsMismatch {
            reported: 16,
            pinned: 32,
        };
        assert!(err.to_string().contains("16"));
        assert!(err.to_string().contains("32"));

        let err = ProtocolError::UnknownEvent(42);
        assert_eq!(err.to_string(), "unknown event: 42");
    }

    #[test]
    fn config_error_preserves_message() {
        let err = OrchestratorError::Config("LISTEN_ADDR is invalid".to_string());
        assert_eq!(err.to_string(), "configuration error: LISTEN_ADDR is invalid");
    }

    #[test]
    fn validation_errors_are_classified() {
        assert!(OrchestratorError::NodeBusy("a".to_string()).is_validation());
        assert!(OrchestratorError::UnknownToNode.is_validation());
        assert!(OrchestratorError::NodeNotConnected("b".to_string()).is_validation());
        assert!(!OrchestratorError::NoNodeLauncher.is_validation());
        assert!(!OrchestratorError::FullMigrationCancelled.is_validation());
        assert!(!OrchestratorError::NodeLaunchExhausted { attempts: 5 }.is_validation());
    }
}
