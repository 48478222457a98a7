//! Shard orchestrator
//!
//! Tracks connected nodes, resolves the total shard count, hands out shards,
//! reconciles missing ones and coordinates live shard migrations.

mod cluster;
mod launcher;
mod migration;
mod monitor;
mod node_conn;
mod provider;
mod status;
mod updater;

pub use cluster::{Orchestrator, OrchestratorBuilder};
pub use launcher::{LaunchedNode, NodeLauncher, ProcessNodeLauncher};
pub use node_conn::NodeConn;
pub use provider::{DiscordShardCountProvider, ShardCountProvider};
pub use status::NodeStatus;
pub use updater::{CommandVersionUpdater, VersionUpdater};
