//! Worker-side client of the orchestrator
//!
//! A `NodeAgent` keeps one control connection open, identifies itself with
//! the shards it believes it runs, executes commands through the
//! `NodeCapability` and drives the destination half of a shard migration.
//! When the connection drops it retries every `reconnect_interval` forever,
//! queueing outgoing messages until the next session is established.

use crate::config::AgentConfig;
use crate::error::{ProtocolError, TransportError};
use crate::node::capability::{NodeCapability, SessionInfo};
use crate::protocol::{
    AllUserDataSentData, IdentifiedData, IdentifyData, Message, PrepareShardMigrationData,
    StartShardsData, StopShardData, UserEventRegistry, LOGIC_VERSION,
};
use crate::shard::{MigrationRole, ResumeState};
use crate::transport::{Connection, MessageHandler};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Coarse view of the agent's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Disconnected,
    Connecting,
    Running,
    MigratingFrom,
    MigratingTo,
}

#[derive(Debug, Default)]
struct MigrationProgress {
    role: MigrationRole,
    shard: Option<u32>,
    resume: ResumeState,
    processed_user_events: u64,
    expected_user_events: Option<u64>,
}

impl MigrationProgress {
    /// Whether the destination has seen every user event the origin sent
    fn is_complete(&self) -> bool {
        self.role == MigrationRole::MigratingTo
            && self
                .expected_user_events
                .is_some_and(|expected| self.processed_user_events >= expected)
    }
}

#[derive(Debug, Default)]
struct AgentState {
    conn: Option<Arc<Connection>>,
    identified: bool,
    reconnecting: bool,
    closing: bool,
    total_shards: u32,
    shards: BTreeSet<u32>,
    send_queue: VecDeque<Message>,
    migration: MigrationProgress,
}

struct AgentInner {
    config: AgentConfig,
    capability: Arc<dyn NodeCapability>,
    registry: Arc<UserEventRegistry>,
    state: Mutex<AgentState>,
}

/// Handle to a node's orchestrator connection. Cheap to clone.
#[derive(Clone)]
pub struct NodeAgent {
    inner: Arc<AgentInner>,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        capability: Arc<dyn NodeCapability>,
        registry: Arc<UserEventRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                config,
                capability,
                registry,
                state: Mutex::new(AgentState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start connecting in the background. Returns immediately; the agent
    /// keeps retrying until the orchestrator is reachable.
    pub fn start(&self) {
        self.spawn_reconnect();
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Shards this node believes it runs
    pub fn shards(&self) -> Vec<u32> {
        self.state().shards.iter().copied().collect()
    }

    /// Total shard count of the last session, `0` before the first one
    pub fn total_shards(&self) -> u32 {
        self.state().total_shards
    }

    pub fn phase(&self) -> AgentPhase {
        let state = self.state();
        if state.conn.is_none() {
            return if state.reconnecting {
                AgentPhase::Connecting
            } else {
                AgentPhase::Disconnected
            };
        }
        if !state.identified {
            return AgentPhase::Connecting;
        }
        match state.migration.role {
            MigrationRole::None => AgentPhase::Running,
            MigrationRole::MigratingFrom => AgentPhase::MigratingFrom,
            MigrationRole::MigratingTo => AgentPhase::MigratingTo,
        }
    }

    /// Stop the agent for good: the connection is closed and never retried
    pub async fn close(&self) {
        let conn = {
            let mut state = self.state();
            state.closing = true;
            state.identified = false;
            state.conn.take()
        };

        if let Some(conn) = conn {
            conn.close().await;
        }
        info!(node_id = %self.node_id(), "Node agent closed");
    }

    /// Drop the current connection and let the reconnect loop establish a
    /// new session
    pub async fn reconnect(&self) {
        let conn = self.state().conn.clone();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// Encode a registered user event and send it to the orchestrator,
    /// queueing it while disconnected
    pub async fn send_user_event<T: Serialize>(
        &self,
        event_id: u32,
        data: &T,
    ) -> Result<(), ProtocolError> {
        let msg = self.inner.registry.encode(event_id, data)?;
        self.send(msg).await;
        Ok(())
    }

    /// Send a message, queueing it for replay if there is no established
    /// session
    pub async fn send(&self, msg: Message) {
        let conn = {
            let mut state = self.state();
            match (&state.conn, state.identified) {
                (Some(conn), true) => conn.clone(),
                _ => {
                    debug!(node_id = %self.node_id(), event = %msg.event_type(), "Queueing message");
                    state.send_queue.push_back(msg);
                    return;
                }
            }
        };

        if let Err(e) = conn.send(&msg).await {
            warn!(
                node_id = %self.node_id(),
                event = %msg.event_type(),
                error = %e,
                "Failed sending message to orchestrator, queueing it"
            );
            self.state().send_queue.push_back(msg);
        }
    }

    fn spawn_reconnect(&self) {
        {
            let mut state = self.state();
            if state.reconnecting || state.closing {
                return;
            }
            state.reconnecting = true;
        }

        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                if agent.state().closing {
                    agent.state().reconnecting = false;
                    return;
                }

                match agent.connect().await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(
                            node_id = %agent.node_id(),
                            addr = %agent.inner.config.orchestrator_addr,
                            error = %e,
                            "Failed connecting to orchestrator, retrying"
                        );
                    }
                }

                tokio::time::sleep(agent.inner.config.reconnect_interval).await;
            }
        });
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let conn = Connection::connect(self.inner.config.orchestrator_addr.as_str()).await?;
        conn.set_id(self.node_id());

        let identify = {
            let mut state = self.state();
            state.reconnecting = false;
            if state.closing {
                None
            } else {
                state.conn = Some(conn.clone());
                state.identified = false;

                Some(IdentifyData {
                    node_id: self.node_id().to_string(),
                    total_shards: state.total_shards,
                    running_shards: state.shards.iter().copied().collect(),
                    version: self.inner.config.version.clone(),
                    logic_version: LOGIC_VERSION,
                })
            }
        };

        let Some(identify) = identify else {
            conn.close().await;
            return Ok(());
        };

        tokio::spawn(conn.clone().listen(Arc::new(self.clone())));

        // A failed identify surfaces as a closed connection and retries
        conn.send_or_log(&Message::Identify(identify)).await;
        info!(node_id = %self.node_id(), "Sent identify");
        Ok(())
    }

    async fn handle_identified(&self, conn: &Arc<Connection>, data: IdentifiedData) {
        conn.set_id(data.node_id.as_str());
        self.state().total_shards = data.total_shards;

        // Replay queued messages before anything new can overtake them
        loop {
            let batch: Vec<Message> = {
                let mut state = self.state();
                if state.send_queue.is_empty() {
                    state.identified = true;
                    break;
                }
                state.send_queue.drain(..).collect()
            };

            debug!(node_id = %self.node_id(), count = batch.len(), "Replaying queued messages");
            for msg in &batch {
                conn.send_or_log(msg).await;
            }
        }

        info!(
            node_id = %self.node_id(),
            total_shards = data.total_shards,
            "Session established"
        );

        self.inner
            .capability
            .session_established(SessionInfo {
                total_shards: data.total_shards,
            })
            .await;
    }

    async fn handle_start_shards(&self, data: StartShardsData) {
        self.inner.capability.add_new_shards(&data.shard_ids).await;

        self.state().shards.extend(data.shard_ids.iter().copied());
        info!(node_id = %self.node_id(), shards = ?data.shard_ids, "Added shards");

        self.send(Message::StartShards(data)).await;
    }

    async fn handle_stop_shard(&self, data: StopShardData) {
        self.state().shards.remove(&data.shard_id);
        info!(node_id = %self.node_id(), shard_id = data.shard_id, "Stopping shard");

        self.inner.capability.stop_shard(data.shard_id).await;

        self.send(Message::StopShard(data)).await;
    }

    async fn handle_prepare_migration(&self, mut data: PrepareShardMigrationData) {
        let shard_id = data.shard_id;

        if data.origin {
            {
                let mut state = self.state();
                state.migration = MigrationProgress {
                    role: MigrationRole::MigratingFrom,
                    shard: Some(shard_id),
                    ..Default::default()
                };
                state.shards.remove(&shard_id);
            }
            info!(node_id = %self.node_id(), shard_id, "Preparing outgoing shard migration");

            let resume = self
                .inner
                .capability
                .initialize_shard_transfer_from(shard_id)
                .await;
            resume.fill(&mut data);
        } else {
            let resume = ResumeState::from(&data);
            {
                let mut state = self.state();
                state.migration = MigrationProgress {
                    role: MigrationRole::MigratingTo,
                    shard: Some(shard_id),
                    resume: resume.clone(),
                    processed_user_events: 0,
                    expected_user_events: None,
                };
                state.shards.insert(shard_id);
            }
            info!(node_id = %self.node_id(), shard_id, "Preparing incoming shard migration");

            self.inner
                .capability
                .initialize_shard_transfer_to(shard_id, resume)
                .await;
        }

        self.send(Message::PrepareShardMigration(data)).await;
    }

    fn handle_start_migration(&self, shard_id: u32) {
        let agent = self.clone();
        tokio::spawn(async move {
            let num_events = agent
                .inner
                .capability
                .start_shard_transfer_from(shard_id)
                .await;

            info!(
                node_id = %agent.node_id(),
                shard_id,
                num_events,
                "Scheduled all user data for migration"
            );

            agent
                .send(Message::AllUserDataSent(AllUserDataSentData { num_events }))
                .await;

            let mut state = agent.state();
            if state.migration.role == MigrationRole::MigratingFrom
                && state.migration.shard == Some(shard_id)
            {
                state.migration = MigrationProgress::default();
            }
        });
    }

    async fn handle_all_user_data_sent(&self, data: AllUserDataSentData) {
        let complete = {
            let mut state = self.state();
            debug!(
                node_id = %self.node_id(),
                expected = data.num_events,
                processed = state.migration.processed_user_events,
                "All user data sent"
            );
            state.migration.expected_user_events = Some(data.num_events);
            state.migration.is_complete()
        };

        if complete {
            self.finish_migration().await;
        }
    }

    async fn handle_user_event(&self, event_id: u32, payload: Vec<u8>) {
        match self.inner.registry.decode(event_id, &payload) {
            Ok(decoded) => {
                self.inner
                    .capability
                    .handle_user_event(event_id, decoded)
                    .await;
            }
            Err(e) => {
                error!(
                    node_id = %self.node_id(),
                    event_id,
                    error = %e,
                    "Failed decoding user event, skipping it"
                );
            }
        }

        let complete = {
            let mut state = self.state();
            if state.migration.role != MigrationRole::MigratingTo {
                return;
            }
            state.migration.processed_user_events += 1;
            state.migration.is_complete()
        };

        if complete {
            self.finish_migration().await;
        }
    }

    /// Resume the migrated shard and report it as started. Migration state
    /// is cleared first so a late duplicate trigger finds nothing to finish.
    async fn finish_migration(&self) {
        let (shard_id, resume) = {
            let mut state = self.state();
            let migration = std::mem::take(&mut state.migration);
            match migration.shard {
                Some(shard_id) if migration.role == MigrationRole::MigratingTo => {
                    (shard_id, migration.resume)
                }
                _ => return,
            }
        };

        self.inner.capability.resume_shard(shard_id, resume).await;

        self.send(Message::StartShards(StartShardsData {
            shard_ids: vec![shard_id],
        }))
        .await;

        info!(node_id = %self.node_id(), shard_id, "Finished migrating shard");
    }
}

#[async_trait]
impl MessageHandler for NodeAgent {
    async fn handle_message(&self, conn: &Arc<Connection>, msg: Message) {
        match msg {
            Message::Identified(data) => self.handle_identified(conn, data).await,
            Message::StartShards(data) => self.handle_start_shards(data).await,
            Message::StopShard(data) => self.handle_stop_shard(data).await,
            Message::Shutdown => {
                info!(node_id = %self.node_id(), "Shutdown requested by orchestrator");
                self.inner.capability.shutdown().await;
            }
            Message::PrepareShardMigration(data) => self.handle_prepare_migration(data).await,
            Message::StartShardMigration(data) => self.handle_start_migration(data.shard_id),
            Message::AllUserDataSent(data) => self.handle_all_user_data_sent(data).await,
            Message::User { event_id, payload } => self.handle_user_event(event_id, payload).await,
            Message::Identify(_) => {
                warn!(node_id = %self.node_id(), "Ignoring identify sent to a node");
            }
        }
    }

    async fn connection_closed(&self, conn: &Arc<Connection>) {
        {
            let mut state = self.state();
            let current = state
                .conn
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, conn));
            if !current {
                return;
            }
            state.conn = None;
            state.identified = false;
            if state.closing {
                return;
            }
        }

        warn!(node_id = %self.node_id(), "Lost connection to orchestrator, reconnecting");
        self.spawn_reconnect();
    }
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node_id", &self.node_id())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_completes_only_on_destination_at_threshold() {
        let mut progress = MigrationProgress {
            role: MigrationRole::MigratingTo,
            shard: Some(3),
            ..Default::default()
        };
        assert!(!progress.is_complete());

        progress.processed_user_events = 2;
        progress.expected_user_events = Some(3);
        assert!(!progress.is_complete());

        progress.processed_user_events = 3;
        assert!(progress.is_complete());

        progress.role = MigrationRole::MigratingFrom;
        assert!(!progress.is_complete());
    }

    #[test]
    fn zero_user_events_completes_immediately() {
        let progress = MigrationProgress {
            role: MigrationRole::MigratingTo,
            shard: Some(0),
            expected_user_events: Some(0),
            ..Default::default()
        };
        assert!(progress.is_complete());
    }
}
