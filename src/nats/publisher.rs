//! Node roster publisher
//!
//! Publishes the ids of connected nodes so other services can discover the
//! fleet without talking to the orchestrator directly.

use crate::error::NatsError;
use crate::orchestrator::{NodeStatus, Orchestrator};
use async_nats::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Subject the roster is published on
pub const ROSTER_SUBJECT: &str = "orchestrator.nodes";

/// Publication interval
pub const ROSTER_INTERVAL: Duration = Duration::from_secs(10);

/// Published roster payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roster {
    pub nodes: Vec<String>,
    pub total_shards: Option<u32>,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl Roster {
    /// Roster of the connected, identified nodes
    pub fn from_statuses(statuses: &[NodeStatus], total_shards: Option<u32>) -> Self {
        Self {
            nodes: statuses
                .iter()
                .filter(|s| s.connected && s.session_established)
                .map(|s| s.id.clone())
                .collect(),
            total_shards,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

/// NATS publisher for the node roster
pub struct RosterPublisher {
    client: Client,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl RosterPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, NatsError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers).await?;

        info!("Connected to NATS");

        Ok(Arc::new(Self {
            client,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish one roster snapshot
    pub async fn publish(&self, roster: &Roster) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(roster)?;

        match self.client.publish(ROSTER_SUBJECT, payload.into()).await {
            Ok(()) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject = ROSTER_SUBJECT, nodes = roster.nodes.len(), "Roster published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subject = ROSTER_SUBJECT, error = %e, "Failed to publish roster");
                Err(e.into())
            }
        }
    }

    /// Publish the roster every `ROSTER_INTERVAL` until the task is dropped
    pub async fn run(self: Arc<Self>, orchestrator: Orchestrator) {
        let mut ticker = tokio::time::interval(ROSTER_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let roster = Roster::from_statuses(
                &orchestrator.get_full_nodes_status(),
                orchestrator.total_shards(),
            );
            // Failures are counted and logged, the next tick retries
            let _ = self.publish(&roster).await;
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed flushing NATS connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, connected: bool, session_established: bool) -> NodeStatus {
        NodeStatus {
            id: id.to_string(),
            connected,
            session_established,
            ..Default::default()
        }
    }

    #[test]
    fn test_roster_lists_connected_identified_nodes() {
        let roster = Roster::from_statuses(
            &[
                status("node-a", true, true),
                status("node-b", false, true),
                status("unknown-1", true, false),
                status("node-c", true, true),
            ],
            Some(32),
        );

        assert_eq!(roster.nodes, vec!["node-a", "node-c"]);
        assert_eq!(roster.total_shards, Some(32));
        assert!(roster.timestamp > 0);
    }

    #[test]
    fn test_roster_serialization() {
        let roster = Roster {
            nodes: vec!["node-a".to_string()],
            total_shards: None,
            timestamp: 1,
        };
        let json = serde_json::to_string(&roster).unwrap();
        assert_eq!(json, r#"{"nodes":["node-a"],"total_shards":null,"timestamp":1}"#);
    }

    #[test]
    fn test_subject_constant() {
        assert_eq!(ROSTER_SUBJECT, "orchestrator.nodes");
    }
}
