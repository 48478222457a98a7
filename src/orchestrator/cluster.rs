//! Cluster bookkeeping and operator commands
//!
//! The cluster lock guards the node list, the pinned total shard count, the
//! blacklist and the fleet migration flag. It is a std mutex and is never
//! held across an await; per-node locks may be taken while holding it.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, TransportError};
use crate::orchestrator::monitor::Monitor;
use crate::orchestrator::node_conn::{NodeConn, NodeHandler};
use crate::orchestrator::{
    LaunchedNode, NodeLauncher, NodeStatus, ShardCountProvider, VersionUpdater,
};
use crate::telemetry;
use crate::transport::Connection;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub(super) struct Cluster {
    pub nodes: Vec<Arc<NodeConn>>,
    pub total_shards: Option<u32>,
    pub blacklist: BTreeSet<String>,
    pub performing_full_migration: bool,
}

struct Inner {
    config: OrchestratorConfig,
    cluster: Mutex<Cluster>,
    launcher: Option<Arc<dyn NodeLauncher>>,
    shard_count_provider: Option<Arc<dyn ShardCountProvider>>,
    version_updater: Option<Arc<dyn VersionUpdater>>,
    halt: watch::Sender<Option<String>>,
    shutdown: watch::Sender<bool>,
    /// Set while a fleet migration is asked to stop, reset when it ends
    full_migration_cancel: watch::Sender<bool>,
}

/// Builder for an `Orchestrator` with optional launcher, shard count
/// provider and version updater
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    launcher: Option<Arc<dyn NodeLauncher>>,
    shard_count_provider: Option<Arc<dyn ShardCountProvider>>,
    version_updater: Option<Arc<dyn VersionUpdater>>,
}

impl OrchestratorBuilder {
    pub fn node_launcher(mut self, launcher: Arc<dyn NodeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn shard_count_provider(mut self, provider: Arc<dyn ShardCountProvider>) -> Self {
        self.shard_count_provider = Some(provider);
        self
    }

    pub fn version_updater(mut self, updater: Arc<dyn VersionUpdater>) -> Self {
        self.version_updater = Some(updater);
        self
    }

    pub fn build(self) -> Orchestrator {
        let cluster = Cluster {
            total_shards: self.config.fixed_total_shards,
            ..Default::default()
        };
        let (halt, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let (full_migration_cancel, _) = watch::channel(false);

        Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                cluster: Mutex::new(cluster),
                launcher: self.launcher,
                shard_count_provider: self.shard_count_provider,
                version_updater: self.version_updater,
                halt,
                shutdown,
                full_migration_cancel,
            }),
        }
    }
}

/// Shard orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            launcher: None,
            shard_count_provider: None,
            version_updater: None,
        }
    }

    pub fn new(config: OrchestratorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub(super) fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.inner
            .cluster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting node connections and run the reconciliation monitor.
    ///
    /// The control channel is unauthenticated; never expose it publicly.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, OrchestratorError> {
        let listener = TcpListener::bind(&self.inner.config.listen_addr)
            .await
            .map_err(TransportError::from)?;
        let addr = listener.local_addr().map_err(TransportError::from)?;

        info!(%addr, "Listening for incoming nodes");

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(Monitor::new(self.clone()).run(self.inner.shutdown.subscribe()));

        Ok(addr)
    }

    /// Stop accepting nodes, stop the monitor and close all node connections
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.cancel_full_migration();

        let nodes = self.cluster().nodes.clone();
        for node in nodes {
            node.conn().close().await;
        }
        info!("Orchestrator stopped");
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "New node connection");
                    self.add_connection(stream);
                }
                Err(e) => {
                    error!(error = %e, "Failed accepting incoming connection");
                    break;
                }
            }
        }
    }

    fn add_connection(&self, stream: TcpStream) {
        let conn = Connection::new(stream);
        let node = NodeConn::new(conn.clone());

        self.cluster().nodes.push(node.clone());

        let handler = Arc::new(NodeHandler {
            node,
            orchestrator: self.clone(),
        });
        tokio::spawn(conn.listen(handler));
    }

    /// Receiver that turns `Some(reason)` when the orchestrator hit a fatal
    /// inconsistency and the process should exit
    pub fn subscribe_halt(&self) -> watch::Receiver<Option<String>> {
        self.inner.halt.subscribe()
    }

    pub(super) fn halt(&self, reason: String) {
        self.inner.halt.send_replace(Some(reason));
    }

    /// Cancel signal to hand to `migrate_all_nodes_to_new_nodes`, tripped by
    /// `cancel_full_migration`
    pub fn full_migration_cancel(&self) -> watch::Receiver<bool> {
        self.inner.full_migration_cancel.subscribe()
    }

    /// Ask the running fleet migration to stop at its next wait. Returns
    /// false when none is running.
    pub fn cancel_full_migration(&self) -> bool {
        let cluster = self.cluster();
        if !cluster.performing_full_migration {
            return false;
        }
        self.inner.full_migration_cancel.send_replace(true);
        info!("Cancelling full migration");
        true
    }

    /// Release the fleet migration flag and disarm the cancel signal
    pub(super) fn end_full_migration(&self) {
        let mut cluster = self.cluster();
        cluster.performing_full_migration = false;
        self.inner.full_migration_cancel.send_replace(false);
    }

    /// Drop a node from the cluster without touching its connection
    pub(super) fn forget_node(&self, node: &Arc<NodeConn>) {
        self.cluster().nodes.retain(|n| !Arc::ptr_eq(n, node));
    }

    /// Close and remove older connections that declared the same node id
    pub(super) async fn evict_duplicates(&self, node: &Arc<NodeConn>) {
        let id = node.id();
        let evicted: Vec<Arc<NodeConn>> = {
            let mut cluster = self.cluster();
            let (evicted, kept) = std::mem::take(&mut cluster.nodes)
                .into_iter()
                .partition(|n| !Arc::ptr_eq(n, node) && n.id() == id);
            cluster.nodes = kept;
            evicted
        };

        for old in evicted {
            warn!(node_id = %id, "Closing older connection of re-identified node");
            old.conn().close().await;
        }
    }

    pub fn find_node_by_id(&self, id: &str) -> Option<Arc<NodeConn>> {
        self.cluster().nodes.iter().find(|n| n.id() == id).cloned()
    }

    /// Full status of every known node, connected or not
    pub fn get_full_nodes_status(&self) -> Vec<NodeStatus> {
        let (nodes, blacklist) = {
            let cluster = self.cluster();
            (cluster.nodes.clone(), cluster.blacklist.clone())
        };

        nodes
            .iter()
            .map(|node| {
                let mut status = node.status();
                status.blacklisted = blacklist.contains(&status.id);
                status
            })
            .collect()
    }

    pub fn total_shards(&self) -> Option<u32> {
        self.cluster().total_shards
    }

    fn pin_total_shards(&self, total: u32) {
        let mut cluster = self.cluster();
        if cluster.total_shards.is_none() {
            cluster.total_shards = Some(total);
            info!(total_shards = total, "Pinned total shard count");
        }
    }

    /// Forget the pinned total shard count (falls back to the fixed count)
    pub fn reset_total_shards(&self) {
        self.cluster().total_shards = self.inner.config.fixed_total_shards;
        info!("Reset total shard count");
    }

    /// Authoritative total shard count for an identifying node.
    ///
    /// A node without a count waits up to the startup grace window for
    /// another node to supply one, then a fresh count is fetched and pinned.
    /// A node reporting a count different from the pinned one is rejected.
    pub(super) async fn resolve_total_shards(&self, reported: u32) -> Result<u32, OrchestratorError> {
        if reported == 0 && self.total_shards().is_none() {
            if !self.inner.config.skip_startup_grace {
                let poll = std::time::Duration::from_millis(100);
                let deadline = tokio::time::Instant::now() + self.inner.config.startup_grace;
                while tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(poll).await;
                    if self.total_shards().is_some() {
                        break;
                    }
                }
            }

            while self.total_shards().is_none() {
                match self.fetch_total_shards().await {
                    Ok(total) => self.pin_total_shards(total),
                    Err(e) => {
                        error!(error = %e, "Failed fetching total shard count, retrying");
                        telemetry::record_error(&e);
                        tokio::time::sleep(self.inner.config.shard_count_retry).await;
                    }
                }
            }
        }

        let mut cluster = self.cluster();
        match cluster.total_shards {
            Some(pinned) if reported > 0 && reported != pinned => {
                Err(OrchestratorError::TotalShardsMismatch { reported, pinned })
            }
            Some(pinned) => Ok(pinned),
            None => {
                cluster.total_shards = Some(reported);
                info!(total_shards = reported, "Pinned total shard count reported by node");
                Ok(reported)
            }
        }
    }

    /// Total shard count for the monitor, fetching it if still unknown
    pub(super) async fn ensure_total_shards(&self) -> Option<u32> {
        if let Some(total) = self.total_shards() {
            return Some(total);
        }

        match self.fetch_total_shards().await {
            Ok(total) => {
                self.pin_total_shards(total);
                self.total_shards()
            }
            Err(e) => {
                error!(error = %e, "Monitor failed fetching total shard count");
                telemetry::record_error(&e);
                None
            }
        }
    }

    async fn fetch_total_shards(&self) -> Result<u32, OrchestratorError> {
        if let Some(fixed) = self.inner.config.fixed_total_shards {
            return Ok(fixed);
        }

        let provider = self.inner.shard_count_provider.as_ref().ok_or_else(|| {
            OrchestratorError::ShardCount("no shard count provider configured".to_string())
        })?;

        match provider.total_shard_count().await? {
            0 => Err(OrchestratorError::ShardCount(
                "provider returned 0 shards".to_string(),
            )),
            total => Ok(total),
        }
    }

    pub(super) fn refresh_fleet_gauges(&self) {
        let nodes = self.cluster().nodes.clone();
        let (connected, shards) = nodes.iter().fold((0, 0), |(connected, shards), node| {
            let state = node.state();
            if state.connected {
                (connected + 1, shards + state.running_shards.len())
            } else {
                (connected, shards)
            }
        });
        telemetry::set_fleet_size(connected, shards);
    }

    /// Whether this orchestrator reconciles the shard (multi-host mode)
    pub fn is_responsible_for_shard(&self, shard_id: u32) -> bool {
        let responsible = &self.inner.config.responsible_for_shards;
        responsible.is_empty() || responsible.contains(&shard_id)
    }

    /// Exclude a node from automatic shard assignment. Shards already
    /// running there stay.
    pub fn blacklist_node(&self, node_id: &str) {
        if self.cluster().blacklist.insert(node_id.to_string()) {
            info!(node_id, "Blacklisted node");
        }
    }

    pub fn is_blacklisted(&self, node_id: &str) -> bool {
        self.cluster().blacklist.contains(node_id)
    }

    /// Launch a new node. Does not wait for it to connect.
    pub async fn start_new_node(&self) -> Result<String, OrchestratorError> {
        let launcher = self
            .inner
            .launcher
            .as_ref()
            .ok_or(OrchestratorError::NoNodeLauncher)?;

        match launcher.launch_new_node().await {
            Ok(node_id) => {
                info!(node_id = %node_id, "Launched new node");
                telemetry::record_node_launch("ok");
                Ok(node_id)
            }
            Err(e) => {
                telemetry::record_node_launch("error");
                telemetry::record_error(&e);
                Err(e)
            }
        }
    }

    /// Version of the node binary a launch would start
    pub async fn launch_version(&self) -> Result<String, OrchestratorError> {
        let launcher = self
            .inner
            .launcher
            .as_ref()
            .ok_or(OrchestratorError::NoNodeLauncher)?;
        launcher.launch_version().await
    }

    /// Nodes the launcher started whose process is still alive
    pub fn launched_nodes(&self) -> Vec<(String, LaunchedNode)> {
        self.inner
            .launcher
            .as_ref()
            .map(|launcher| launcher.launched_nodes())
            .unwrap_or_default()
    }

    /// Have the version updater fetch a new node build
    pub async fn pull_new_version(&self) -> Result<String, OrchestratorError> {
        let updater = self
            .inner
            .version_updater
            .as_ref()
            .ok_or(OrchestratorError::NoVersionUpdater)?;

        match updater.pull_new_version().await {
            Ok(version) => {
                info!(version = %version, "Pulled new node version");
                Ok(version)
            }
            Err(e) => {
                telemetry::record_error(&e);
                Err(e)
            }
        }
    }

    /// Start shards on a node, refusing if any of them already runs on a
    /// connected node
    pub async fn start_shards(&self, node_id: &str, shard_ids: &[u32]) -> Result<(), OrchestratorError> {
        for status in self.get_full_nodes_status() {
            if !status.connected {
                continue;
            }
            if let Some(&running) = shard_ids.iter().find(|&&s| status.runs_shard(s)) {
                return Err(OrchestratorError::ShardAlreadyRunning(running));
            }
        }

        let node = self
            .find_node_by_id(node_id)
            .ok_or_else(|| OrchestratorError::UnknownNode(node_id.to_string()))?;

        info!(node_id, shards = ?shard_ids, "Starting shards");
        node.start_shards(shard_ids.to_vec()).await;
        Ok(())
    }

    /// Stop a shard on whichever connected node runs it. Not running is
    /// not an error.
    pub async fn stop_shard(&self, shard_id: u32) -> Result<(), OrchestratorError> {
        for status in self.get_full_nodes_status() {
            if !status.connected || !status.runs_shard(shard_id) {
                continue;
            }

            let node = self
                .find_node_by_id(&status.id)
                .ok_or_else(|| OrchestratorError::UnknownNode(status.id.clone()))?;

            info!(node_id = %status.id, shard_id, "Stopping shard");
            node.stop_shard(shard_id).await;
        }
        Ok(())
    }

    pub async fn shutdown_node(&self, node_id: &str) -> Result<(), OrchestratorError> {
        let node = self
            .find_node_by_id(node_id)
            .ok_or_else(|| OrchestratorError::UnknownNode(node_id.to_string()))?;

        info!(node_id, "Shutting down node");
        node.shutdown().await;
        Ok(())
    }

    /// Close a node's connection and forget it
    pub async fn remove_node(&self, node_id: &str) -> Result<(), OrchestratorError> {
        let node = {
            let mut cluster = self.cluster();
            let pos = cluster
                .nodes
                .iter()
                .position(|n| n.id() == node_id)
                .ok_or_else(|| OrchestratorError::UnknownNode(node_id.to_string()))?;
            cluster.nodes.remove(pos)
        };

        node.conn().close().await;
        info!(node_id, "Removed node");
        self.refresh_fleet_gauges();
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cluster = self.cluster();
        f.debug_struct("Orchestrator")
            .field("nodes", &cluster.nodes.len())
            .field("total_shards", &cluster.total_shards)
            .finish()
    }
}
