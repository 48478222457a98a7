//! Deployment updates
//!
//! A `VersionUpdater` fetches a new node build (from CI, an artifact store,
//! ...) so the next launched nodes run it. Pair it with a fleet migration to
//! roll the whole fleet onto the new version.

use crate::config::UpdaterConfig;
use crate::error::OrchestratorError;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Pulls a new node version into the deployment
#[async_trait]
pub trait VersionUpdater: Send + Sync + 'static {
    /// Fetch the newest build and return its version
    async fn pull_new_version(&self) -> Result<String, OrchestratorError>;
}

/// Runs a deploy script; the last non-empty line it prints is the version
pub struct CommandVersionUpdater {
    config: UpdaterConfig,
}

impl CommandVersionUpdater {
    pub fn new(config: UpdaterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VersionUpdater for CommandVersionUpdater {
    async fn pull_new_version(&self) -> Result<String, OrchestratorError> {
        info!(cmd = %self.config.cmd, "Pulling new node version");

        let output = Command::new(&self.config.cmd)
            .args(&self.config.args)
            .output()
            .await
            .map_err(|e| OrchestratorError::VersionPull(Box::new(e)))?;

        if !output.status.success() {
            return Err(OrchestratorError::VersionPull(
                format!("pull command exited with {}", output.status).into(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(output = %stdout, "Pull command finished");

        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::VersionPull("pull command printed no version".into()))
    }
}
