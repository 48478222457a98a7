//! Business logic a worker process plugs into its `NodeAgent`

use crate::protocol::UserPayload;
use crate::shard::ResumeState;
use async_trait::async_trait;

/// Session details handed to the worker once the orchestrator accepted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub total_shards: u32,
}

/// Shard lifecycle hooks invoked by the node agent
///
/// Calls for one connection arrive sequentially, in the order the
/// orchestrator issued them, except `start_shard_transfer_from` which runs
/// on its own task.
#[async_trait]
pub trait NodeCapability: Send + Sync + 'static {
    /// Notification only
    async fn session_established(&self, info: SessionInfo);

    /// Disconnect the shard now and return its resume state
    async fn stop_shard(&self, shard_id: u32) -> ResumeState;

    /// Reattach a shard using resume state from another node
    async fn resume_shard(&self, shard_id: u32, resume: ResumeState);

    /// Bring up fresh shards with a full identify
    async fn add_new_shards(&self, shard_ids: &[u32]);

    /// Terminate the process after finishing outstanding work
    async fn shutdown(&self);

    /// Prepare an outgoing migration: close the upstream session and hand
    /// back what the destination needs to resume it
    async fn initialize_shard_transfer_from(&self, shard_id: u32) -> ResumeState;

    /// Prepare for an incoming shard before any user data arrives
    async fn initialize_shard_transfer_to(&self, shard_id: u32, resume: ResumeState);

    /// Schedule emission of all custom migration data for the shard and
    /// return how many user events will be sent in total. Emission may
    /// still be in flight when this returns.
    async fn start_shard_transfer_from(&self, shard_id: u32) -> u64;

    /// One unit of forwarded migration data
    async fn handle_user_event(&self, event_id: u32, payload: UserPayload);
}
