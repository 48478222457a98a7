//! Recommended total shard count
//!
//! Only consulted when no fixed count is configured and no node supplied a
//! count within the startup grace window.

use crate::error::OrchestratorError;
use async_trait::async_trait;
use twilight_http::Client;
use twilight_model::gateway::connection_info::BotConnectionInfo;

/// Source of a fresh total shard count
#[async_trait]
pub trait ShardCountProvider: Send + Sync + 'static {
    async fn total_shard_count(&self) -> Result<u32, OrchestratorError>;
}

/// Asks Discord's authenticated gateway endpoint for the recommended count
pub struct DiscordShardCountProvider {
    client: Client,
}

impl DiscordShardCountProvider {
    pub fn new(token: String) -> Self {
        Self {
            client: Client::new(token),
        }
    }
}

#[async_trait]
impl ShardCountProvider for DiscordShardCountProvider {
    async fn total_shard_count(&self) -> Result<u32, OrchestratorError> {
        let response = self
            .client
            .gateway()
            .authed()
            .await
            .map_err(|e| OrchestratorError::ShardCount(e.to_string()))?;

        let info: BotConnectionInfo = response
            .model()
            .await
            .map_err(|e| OrchestratorError::ShardCount(e.to_string()))?;

        Ok(info.shards)
    }
}
