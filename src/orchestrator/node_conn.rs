//! Orchestrator-side view of one node connection
//!
//! `NodeConn` mirrors the node's shard list and migration role; it owns no
//! business logic. During a migration it relays the handoff messages and
//! opaque user events to the other participant.
//!
//! Lock order: the cluster lock may be held while taking a node lock, never
//! the other way around.

use crate::error::OrchestratorError;
use crate::orchestrator::{NodeStatus, Orchestrator};
use crate::protocol::{
    AllUserDataSentData, IdentifiedData, IdentifyData, Message, PrepareShardMigrationData,
    StartShardMigrationData, StartShardsData, StopShardData, LOGIC_VERSION,
};
use crate::shard::{MigrationRole, ShardMigration};
use crate::telemetry;
use crate::transport::{Connection, MessageHandler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub connected: bool,
    pub disconnected_at: Option<SystemTime>,
    pub session_established: bool,
    pub version: String,
    pub running_shards: Vec<u32>,
    pub migration: ShardMigration,
    /// Destination for user events sent by this node. Outlives the
    /// migration role so events emitted after `AllUserDataSent` still
    /// reach the destination; dropped once the destination reports the
    /// shard started.
    pub relay_peer: Option<String>,
    pub shutting_down: bool,
}

impl NodeState {
    fn add_shard(&mut self, shard_id: u32) {
        if !self.running_shards.contains(&shard_id) {
            self.running_shards.push(shard_id);
        }
    }

    fn remove_shard(&mut self, shard_id: u32) {
        self.running_shards.retain(|&s| s != shard_id);
    }
}

/// A connected (or previously connected) node
pub struct NodeConn {
    conn: Arc<Connection>,
    state: Mutex<NodeState>,
}

impl NodeConn {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            state: Mutex::new(NodeState {
                connected: true,
                ..Default::default()
            }),
        })
    }

    /// Declared node id, or the transient connection id before identify
    pub fn id(&self) -> String {
        self.conn.id()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of this node. `blacklisted` is filled in by the orchestrator.
    pub fn status(&self) -> NodeStatus {
        let id = self.id();
        let state = self.state();

        let (migrating_from, migrating_to) = match state.migration.role {
            MigrationRole::None => (None, None),
            MigrationRole::MigratingFrom => (None, state.migration.peer.clone()),
            MigrationRole::MigratingTo => (state.migration.peer.clone(), None),
        };

        NodeStatus {
            id,
            version: state.version.clone(),
            session_established: state.session_established,
            shards: state.running_shards.clone(),
            connected: state.connected,
            disconnected_at: state
                .disconnected_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64),
            blacklisted: false,
            migrating_from,
            migrating_to,
            migrating_shard: state.migration.shard,
        }
    }

    /// Tell the node to start these shards
    pub(crate) async fn start_shards(&self, shard_ids: Vec<u32>) {
        self.conn
            .send_or_log(&Message::StartShards(StartShardsData { shard_ids }))
            .await;
    }

    /// Tell the node to stop a shard
    pub(crate) async fn stop_shard(&self, shard_id: u32) {
        self.conn
            .send_or_log(&Message::StopShard(StopShardData { shard_id }))
            .await;
    }

    /// Tell the node to shut down completely
    pub(crate) async fn shutdown(&self) {
        self.state().shutting_down = true;
        self.conn.send_or_log(&Message::Shutdown).await;
    }
}

impl std::fmt::Debug for NodeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConn")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receive-loop callbacks for one node connection
pub(crate) struct NodeHandler {
    pub node: Arc<NodeConn>,
    pub orchestrator: Orchestrator,
}

impl NodeHandler {
    async fn handle_identify(&self, conn: &Arc<Connection>, data: IdentifyData) {
        if data.logic_version != LOGIC_VERSION {
            let err = OrchestratorError::IncompatibleLogicVersion {
                reported: data.logic_version,
                required: LOGIC_VERSION,
            };
            error!(node_id = %data.node_id, error = %err, "Incompatible node logic version, halting");
            telemetry::record_error(&err);

            self.orchestrator.forget_node(&self.node);
            conn.close().await;
            self.orchestrator.halt(err.to_string());
            return;
        }

        let total_shards = match self.orchestrator.resolve_total_shards(data.total_shards).await {
            Ok(total) => total,
            Err(e) => {
                error!(node_id = %data.node_id, error = %e, "Rejecting node");
                telemetry::record_error(&e);
                self.orchestrator.forget_node(&self.node);
                conn.close().await;
                return;
            }
        };

        conn.set_id(data.node_id.as_str());
        self.orchestrator.evict_duplicates(&self.node).await;

        conn.send_or_log(&Message::Identified(IdentifiedData {
            node_id: data.node_id.clone(),
            total_shards,
        }))
        .await;

        {
            let mut state = self.node.state();
            state.version = data.version.clone();
            state.session_established = true;
            state.running_shards = data.running_shards.clone();
        }

        info!(
            node_id = %data.node_id,
            version = %data.version,
            total_shards,
            running_shards = ?data.running_shards,
            "Node identified"
        );
        self.orchestrator.refresh_fleet_gauges();
    }

    fn handle_start_shards(&self, data: StartShardsData) {
        let mut completed = None;
        {
            let mut state = self.node.state();
            for &shard_id in &data.shard_ids {
                state.add_shard(shard_id);

                // The destination reports the migrated shard as started
                if state.migration.active_shard() == Some(shard_id) {
                    completed = Some((shard_id, state.migration.peer.clone()));
                    state.migration.clear();
                }
            }
        }

        if let Some((shard_id, origin)) = completed {
            info!(node_id = %self.node.id(), shard_id, "Shard migration completed");
            telemetry::record_migration_completed();

            if let Some(origin) = origin.and_then(|id| self.orchestrator.find_node_by_id(&id)) {
                self.release_relay(&origin);
            }
        }
        self.orchestrator.refresh_fleet_gauges();
    }

    /// Stop relaying `origin`'s user events here
    fn release_relay(&self, origin: &NodeConn) {
        let id = self.node.id();
        let mut state = origin.state();
        if state.relay_peer.as_deref() == Some(id.as_str()) {
            state.relay_peer = None;
        }
    }

    fn handle_stop_shard(&self, data: StopShardData) {
        self.node.state().remove_shard(data.shard_id);
        self.orchestrator.refresh_fleet_gauges();
    }

    /// Look up the other participant, logging if it is gone
    fn migration_peer(&self, peer_id: Option<String>) -> Option<Arc<NodeConn>> {
        let peer = peer_id.and_then(|id| self.orchestrator.find_node_by_id(&id));
        if peer.is_none() {
            error!(node_id = %self.node.id(), "Node disappeared in the middle of shard migration");
        }
        peer
    }

    async fn handle_prepare_migration(&self, mut data: PrepareShardMigrationData) {
        let peer_id = self.node.state().migration.peer.clone();
        let Some(peer) = self.migration_peer(peer_id) else {
            return;
        };

        if data.origin {
            // Origin filled in the resume state, hand it to the destination
            self.node.state().remove_shard(data.shard_id);
            data.origin = false;
            peer.conn()
                .send_or_log(&Message::PrepareShardMigration(data))
                .await;
        } else {
            // Destination is ready, let the origin start sending user data
            peer.conn()
                .send_or_log(&Message::StartShardMigration(StartShardMigrationData {
                    shard_id: data.shard_id,
                }))
                .await;
        }
    }

    async fn handle_all_user_data_sent(&self, data: AllUserDataSentData) {
        let peer_id = {
            let mut state = self.node.state();
            let peer = state.migration.peer.clone().or_else(|| state.relay_peer.clone());
            state.migration.clear();
            peer
        };

        let Some(peer) = self.migration_peer(peer_id) else {
            return;
        };
        peer.conn()
            .send_or_log(&Message::AllUserDataSent(data))
            .await;
    }

    async fn relay_user_event(&self, msg: Message) {
        let peer_id = {
            let state = self.node.state();
            state.migration.peer.clone().or_else(|| state.relay_peer.clone())
        };

        if peer_id.is_none() {
            debug!(
                node_id = %self.node.id(),
                event = %msg.event_type(),
                "Dropping user event sent outside a shard migration"
            );
            return;
        }
        let Some(peer) = self.migration_peer(peer_id) else {
            return;
        };
        peer.conn().send_or_log(&msg).await;
        telemetry::record_user_event_relayed();
    }
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle_message(&self, conn: &Arc<Connection>, msg: Message) {
        telemetry::record_message_received(msg.event_type());

        match msg {
            Message::Identify(data) => self.handle_identify(conn, data).await,
            Message::StartShards(data) => self.handle_start_shards(data),
            Message::StopShard(data) => self.handle_stop_shard(data),
            Message::PrepareShardMigration(data) => self.handle_prepare_migration(data).await,
            Message::AllUserDataSent(data) => self.handle_all_user_data_sent(data).await,
            msg @ Message::User { .. } => self.relay_user_event(msg).await,
            other => {
                debug!(
                    node_id = %self.node.id(),
                    event = %other.event_type(),
                    "Ignoring unexpected message from node"
                );
            }
        }
    }

    async fn connection_closed(&self, _conn: &Arc<Connection>) {
        let shutting_down = {
            let mut state = self.node.state();
            state.connected = false;
            state.disconnected_at = Some(SystemTime::now());
            state.shutting_down
        };

        if shutting_down {
            info!(node_id = %self.node.id(), "Node disconnected after shutdown");
        } else {
            warn!(node_id = %self.node.id(), "Node disconnected");
        }
        self.orchestrator.refresh_fleet_gauges();
    }
}
