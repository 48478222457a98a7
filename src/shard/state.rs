//! Per-shard handoff state
//!
//! Types that travel with a shard while it moves between nodes, shared by
//! the node agent and the orchestrator's node bookkeeping.

use crate::protocol::PrepareShardMigrationData;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Everything needed to reattach a shard's upstream session without a
/// full identify: copied from the origin to the destination, never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub session_id: String,
    pub sequence: u64,
    pub resume_gateway_url: String,
}

impl ResumeState {
    /// Copy the resume fields into an outgoing prepare message
    pub fn fill(&self, data: &mut PrepareShardMigrationData) {
        data.session_id = self.session_id.clone();
        data.sequence = self.sequence;
        data.resume_gateway_url = self.resume_gateway_url.clone();
    }
}

impl From<&PrepareShardMigrationData> for ResumeState {
    fn from(data: &PrepareShardMigrationData) -> Self {
        Self {
            session_id: data.session_id.clone(),
            sequence: data.sequence,
            resume_gateway_url: data.resume_gateway_url.clone(),
        }
    }
}

/// Which side of a migration a node is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationRole {
    #[default]
    None,
    MigratingFrom,
    MigratingTo,
}

/// The migration-role triple (role, peer, shard) of one node
///
/// Mutated only under the owning node's lock.
#[derive(Debug, Clone, Default)]
pub struct ShardMigration {
    pub role: MigrationRole,
    pub peer: Option<String>,
    pub shard: Option<u32>,
    pub started_at: Option<Instant>,
}

impl ShardMigration {
    pub fn is_busy(&self) -> bool {
        self.role != MigrationRole::None
    }

    pub fn begin(&mut self, role: MigrationRole, peer: &str, shard: u32) {
        self.role = role;
        self.peer = Some(peer.to_string());
        self.shard = Some(shard);
        self.started_at = Some(Instant::now());
    }

    /// Drop back to `None`, keeping nothing of the previous migration
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Shard id if this node is currently migrating it
    pub fn active_shard(&self) -> Option<u32> {
        if self.is_busy() {
            self.shard
        } else {
            None
        }
    }
}
