//! Shard, full-node and fleet migrations
//!
//! `start_shard_migration` is the only trigger; the handoff itself is driven
//! by the node agents relaying through their `NodeConn`s. The full-node and
//! fleet operations poll node status until each shard has converged.

use crate::error::OrchestratorError;
use crate::orchestrator::node_conn::NodeConn;
use crate::orchestrator::Orchestrator;
use crate::protocol::{Message, PrepareShardMigrationData};
use crate::shard::MigrationRole;
use crate::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

/// Sleep for `interval` unless cancelled first. Returns false on cancel.
///
/// A dropped cancel sender means the wait can no longer be cancelled.
async fn pause(interval: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }

    let cancelled = async {
        if cancel.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = cancelled => false,
    }
}

/// Clears the fleet migration flag however the migration ends
struct FullMigrationGuard<'a>(&'a Orchestrator);

impl Drop for FullMigrationGuard<'_> {
    fn drop(&mut self) {
        self.0.end_full_migration();
    }
}

impl Orchestrator {
    /// Move a shard to `to_node_id` from whichever connected node runs it
    pub async fn start_shard_migration(
        &self,
        to_node_id: &str,
        shard_id: u32,
    ) -> Result<(), OrchestratorError> {
        let from_node_id = self
            .get_full_nodes_status()
            .into_iter()
            .find(|s| s.connected && s.runs_shard(shard_id))
            .map(|s| s.id)
            .ok_or(OrchestratorError::UnknownFromNode)?;

        self.start_shard_migration_from(&from_node_id, to_node_id, shard_id)
            .await
    }

    /// Move a shard from a specific origin to a destination.
    ///
    /// Both participants get their migration role set before the origin is
    /// told to prepare. Validation failures leave both roles untouched.
    /// Either participant being disconnected is a validation failure.
    pub async fn start_shard_migration_from(
        &self,
        from_node_id: &str,
        to_node_id: &str,
        shard_id: u32,
    ) -> Result<(), OrchestratorError> {
        let from = self
            .find_node_by_id(from_node_id)
            .ok_or(OrchestratorError::UnknownFromNode)?;
        let to = self
            .find_node_by_id(to_node_id)
            .ok_or(OrchestratorError::UnknownToNode)?;

        if !to.is_connected() {
            return Err(OrchestratorError::NodeNotConnected(to_node_id.to_string()));
        }

        let previous_relay = {
            let mut state = from.state();
            if !state.running_shards.contains(&shard_id) {
                return Err(OrchestratorError::FromNodeNotRunningShard {
                    node_id: from_node_id.to_string(),
                    shard_id,
                });
            }
            if !state.connected {
                return Err(OrchestratorError::NodeNotConnected(from_node_id.to_string()));
            }
            if state.migration.is_busy() {
                return Err(OrchestratorError::NodeBusy(from_node_id.to_string()));
            }

            state
                .migration
                .begin(MigrationRole::MigratingFrom, to_node_id, shard_id);
            state.relay_peer.replace(to_node_id.to_string())
        };

        let to_busy = {
            let mut state = to.state();
            let busy = state.migration.is_busy();
            if !busy {
                state
                    .migration
                    .begin(MigrationRole::MigratingTo, from_node_id, shard_id);
            }
            busy
        };

        if to_busy {
            let mut state = from.state();
            state.migration.clear();
            state.relay_peer = previous_relay;
            return Err(OrchestratorError::NodeBusy(to_node_id.to_string()));
        }

        info!(
            shard_id,
            from = from_node_id,
            to = to_node_id,
            "Migrating shard"
        );
        telemetry::record_migration_started();

        from.conn()
            .send_or_log(&Message::PrepareShardMigration(PrepareShardMigrationData {
                origin: true,
                shard_id,
                ..Default::default()
            }))
            .await;

        Ok(())
    }

    /// Migrate every shard of one node to another, one at a time, then
    /// optionally shut the origin down
    pub async fn migrate_full_node(
        &self,
        from_node_id: &str,
        to_node_id: &str,
        shutdown_old_node: bool,
    ) -> Result<(), OrchestratorError> {
        let (_keep, cancel) = watch::channel(false);
        self.migrate_full_node_with_cancel(from_node_id, to_node_id, shutdown_old_node, cancel)
            .await
    }

    /// `migrate_full_node` with a cancel signal for the per-shard waits
    pub async fn migrate_full_node_with_cancel(
        &self,
        from_node_id: &str,
        to_node_id: &str,
        shutdown_old_node: bool,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        let from = self
            .find_node_by_id(from_node_id)
            .ok_or(OrchestratorError::UnknownFromNode)?;
        let to = self
            .find_node_by_id(to_node_id)
            .ok_or(OrchestratorError::UnknownToNode)?;

        let shards = from.state().running_shards.clone();
        info!(
            from = from_node_id,
            to = to_node_id,
            shard_count = shards.len(),
            "Starting full node migration"
        );

        for shard_id in shards {
            self.start_shard_migration_from(from_node_id, to_node_id, shard_id)
                .await?;

            self.wait_for_shard_migration(&from, &to, shard_id, &mut cancel)
                .await?;

            // Reset both roles in case an acknowledgement went missing
            to.state().migration.clear();
            from.state().migration.clear();

            // Let the destination catch up on event processing
            if !pause(self.config().migration.shard_settle_delay, &mut cancel).await {
                return Err(OrchestratorError::MigrationWaitCancelled { shard_id });
            }
        }

        if shutdown_old_node {
            self.shutdown_node(from_node_id).await?;
        }

        Ok(())
    }

    /// Poll until the shard left the origin, appeared on the destination and
    /// the destination dropped its migration role. An origin disconnect
    /// ends every phase early.
    pub async fn wait_for_shard_migration(
        &self,
        from: &Arc<NodeConn>,
        to: &Arc<NodeConn>,
        shard_id: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        let settings = &self.config().migration;
        let deadline = settings.max_wait.map(|max| Instant::now() + max);

        let check_deadline = || match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(OrchestratorError::MigrationWaitTimedOut { shard_id })
            }
            _ => Ok(()),
        };

        // Shard leaves the origin
        loop {
            if !pause(settings.origin_poll_interval, cancel).await {
                return Err(OrchestratorError::MigrationWaitCancelled { shard_id });
            }
            let status = from.status();
            if !status.runs_shard(shard_id) || !status.connected {
                break;
            }
            check_deadline()?;
        }

        // Shard appears on the destination
        loop {
            if !pause(settings.poll_interval, cancel).await {
                return Err(OrchestratorError::MigrationWaitCancelled { shard_id });
            }
            if to.status().runs_shard(shard_id) || !from.is_connected() {
                break;
            }
            check_deadline()?;
        }

        // Destination leaves its migrating role
        loop {
            if !pause(settings.poll_interval, cancel).await {
                return Err(OrchestratorError::MigrationWaitCancelled { shard_id });
            }
            if to.status().migrating_from.is_none() || !from.is_connected() {
                break;
            }
            check_deadline()?;
        }

        Ok(())
    }

    /// Find a connected, empty, idle node not in `ignore`, launching new
    /// nodes as needed
    async fn find_available_node(
        &self,
        ignore: &[String],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, OrchestratorError> {
        let settings = &self.config().migration;
        let mut attempts = 0;
        let mut last_launch: Option<Instant> = None;

        loop {
            let available = self.get_full_nodes_status().into_iter().find(|s| {
                s.connected && s.shards.is_empty() && !s.is_migrating() && !ignore.contains(&s.id)
            });
            if let Some(status) = available {
                return Ok(status.id);
            }

            // Launched nodes may be taken by someone else, so retry after the
            // cooldown rather than waiting for a specific id
            if last_launch.is_some_and(|t| t.elapsed() < settings.launch_cooldown) {
                if !pause(settings.node_poll_interval, cancel).await {
                    return Err(OrchestratorError::FullMigrationCancelled);
                }
                continue;
            }

            attempts += 1;
            if attempts > settings.max_launch_attempts {
                return Err(OrchestratorError::NodeLaunchExhausted {
                    attempts: settings.max_launch_attempts,
                });
            }

            self.start_new_node().await?;
            last_launch = Some(Instant::now());
            if !pause(settings.node_poll_interval, cancel).await {
                return Err(OrchestratorError::FullMigrationCancelled);
            }
        }
    }

    /// Move every loaded node onto a fresh node, shutting the old ones down.
    ///
    /// Only one fleet migration runs at a time. With `return_on_error` the
    /// first failed node aborts the run; otherwise failures are logged.
    /// Tripping `cancel` aborts at the next wait regardless.
    pub async fn migrate_all_nodes_to_new_nodes(
        &self,
        return_on_error: bool,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        {
            let mut cluster = self.cluster();
            if cluster.performing_full_migration {
                return Err(OrchestratorError::FullMigrationInProgress);
            }
            cluster.performing_full_migration = true;
        }
        let _guard = FullMigrationGuard(self);

        info!("Performing a full migration of all nodes");

        let nodes = self.get_full_nodes_status();
        let ignore: Vec<String> = nodes.iter().map(|s| s.id.clone()).collect();

        for node in nodes.iter().filter(|s| s.connected && !s.shards.is_empty()) {
            let target = match self.find_available_node(&ignore, &mut cancel).await {
                Ok(target) => target,
                Err(e) => {
                    telemetry::record_error(&e);
                    return Err(e);
                }
            };

            if let Err(e) = self
                .migrate_full_node_with_cancel(&node.id, &target, true, cancel.clone())
                .await
            {
                telemetry::record_error(&e);
                let cancelled = matches!(
                    e,
                    OrchestratorError::MigrationWaitCancelled { .. }
                        | OrchestratorError::FullMigrationCancelled
                );
                if return_on_error || cancelled {
                    return Err(e);
                }
                error!(from = %node.id, to = %target, error = %e, "Failed migrating node");
            }

            if !pause(self.config().migration.node_settle_delay, &mut cancel).await {
                return Err(OrchestratorError::FullMigrationCancelled);
            }
        }

        info!("Full migration of all nodes finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_sleeps_without_cancel() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(pause(Duration::from_millis(5), &mut rx).await);
    }

    #[tokio::test]
    async fn pause_returns_false_when_cancelled() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        assert!(!pause(Duration::from_secs(60), &mut rx).await);
    }

    #[tokio::test]
    async fn pause_with_dropped_sender_still_sleeps() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let started = Instant::now();
        assert!(pause(Duration::from_millis(20), &mut rx).await);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_long_pause() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause(Duration::from_secs(60), &mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(true);
        assert!(!waiter.await.unwrap());
    }
}
