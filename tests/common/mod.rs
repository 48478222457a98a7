//! Shared harness for the integration tests
//!
//! Runs a real orchestrator on an ephemeral port and real node agents
//! backed by an in-memory `NodeCapability` that records every call.

#![allow(dead_code)]

use arrakis_orchestrator::config::{AgentConfig, MigrationConfig, OrchestratorConfig};
use arrakis_orchestrator::error::OrchestratorError;
use arrakis_orchestrator::node::{NodeAgent, NodeCapability, SessionInfo};
use arrakis_orchestrator::orchestrator::{NodeLauncher, NodeStatus, Orchestrator};
use arrakis_orchestrator::protocol::{UserEventRegistry, UserPayload};
use arrakis_orchestrator::shard::ResumeState;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// User event carrying one piece of guild state during a migration
pub const GUILD_DATA: u32 = 101;

/// Orchestrator settings shrunk for tests, monitor disabled
pub fn test_config(total_shards: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        fixed_total_shards: Some(total_shards),
        skip_startup_grace: true,
        shard_count_retry: Duration::from_millis(20),
        ..Default::default()
    };
    config.monitor.initial_delay = Duration::from_millis(20);
    config.monitor.tick_interval = Duration::from_millis(20);
    config.monitor.bucket_start_interval = Duration::from_millis(20);
    config.migration = MigrationConfig {
        origin_poll_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        max_wait: Some(Duration::from_secs(5)),
        shard_settle_delay: Duration::from_millis(10),
        node_settle_delay: Duration::from_millis(10),
        node_poll_interval: Duration::from_millis(10),
        launch_cooldown: Duration::from_millis(500),
        max_launch_attempts: 3,
    };
    config
}

pub fn registry() -> Arc<UserEventRegistry> {
    let mut registry = UserEventRegistry::new();
    registry
        .register::<String>(GUILD_DATA, "guild_data")
        .expect("register user event");
    Arc::new(registry)
}

/// Poll `check` until it holds or the timeout elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await a future with a generous upper bound
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation timed out")
}

pub fn status_of(orchestrator: &Orchestrator, node_id: &str) -> Option<NodeStatus> {
    orchestrator
        .get_full_nodes_status()
        .into_iter()
        .find(|s| s.id == node_id)
}

/// Whether the node is connected, identified and runs exactly `shards`
pub fn runs_exactly(orchestrator: &Orchestrator, node_id: &str, shards: &[u32]) -> bool {
    status_of(orchestrator, node_id).is_some_and(|s| {
        let mut running = s.shards.clone();
        running.sort_unstable();
        s.connected && s.session_established && running == shards
    })
}

/// Calls a node received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SessionEstablished(u32),
    AddNewShards(Vec<u32>),
    StopShard(u32),
    InitFrom(u32),
    InitTo(u32, ResumeState),
    TransferFrom(u32),
    UserEvent(String),
    Resume(u32, ResumeState),
    Shutdown,
}

/// In-memory worker: remembers calls and emits canned migration data
pub struct MockCapability {
    agent: OnceLock<NodeAgent>,
    calls: Mutex<Vec<Call>>,
    /// Guild data this node sends for a shard it migrates away
    outgoing: Mutex<Vec<String>>,
    sequence: AtomicU32,
    pub shut_down: AtomicBool,
}

impl MockCapability {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            agent: OnceLock::new(),
            calls: Mutex::new(Vec::new()),
            outgoing: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn received_user_data(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UserEvent(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn set_outgoing(&self, data: &[&str]) {
        *self.outgoing.lock().unwrap() = data.iter().map(|s| s.to_string()).collect();
    }

    fn resume_for(&self, shard_id: u32) -> ResumeState {
        ResumeState {
            session_id: format!("session-{shard_id}"),
            sequence: 1000 + u64::from(self.sequence.fetch_add(1, Ordering::SeqCst)),
            resume_gateway_url: "wss://gateway.example/resume".to_string(),
        }
    }
}

#[async_trait]
impl NodeCapability for MockCapability {
    async fn session_established(&self, info: SessionInfo) {
        self.record(Call::SessionEstablished(info.total_shards));
    }

    async fn stop_shard(&self, shard_id: u32) -> ResumeState {
        self.record(Call::StopShard(shard_id));
        self.resume_for(shard_id)
    }

    async fn resume_shard(&self, shard_id: u32, resume: ResumeState) {
        self.record(Call::Resume(shard_id, resume));
    }

    async fn add_new_shards(&self, shard_ids: &[u32]) {
        self.record(Call::AddNewShards(shard_ids.to_vec()));
    }

    async fn shutdown(&self) {
        self.record(Call::Shutdown);
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(agent) = self.agent.get() {
            agent.close().await;
        }
    }

    async fn initialize_shard_transfer_from(&self, shard_id: u32) -> ResumeState {
        self.record(Call::InitFrom(shard_id));
        self.resume_for(shard_id)
    }

    async fn initialize_shard_transfer_to(&self, shard_id: u32, resume: ResumeState) {
        self.record(Call::InitTo(shard_id, resume));
    }

    async fn start_shard_transfer_from(&self, shard_id: u32) -> u64 {
        self.record(Call::TransferFrom(shard_id));

        let outgoing = self.outgoing.lock().unwrap().clone();
        let Some(agent) = self.agent.get() else {
            return 0;
        };
        for data in &outgoing {
            agent
                .send_user_event(GUILD_DATA, data)
                .await
                .expect("registered user event");
        }
        outgoing.len() as u64
    }

    async fn handle_user_event(&self, event_id: u32, payload: UserPayload) {
        assert_eq!(event_id, GUILD_DATA);
        let data = payload
            .downcast::<String>()
            .map(|b| *b)
            .unwrap_or_else(|_| "<unexpected payload>".to_string());
        self.record(Call::UserEvent(data));
    }
}

/// A node agent wired to a mock capability
pub struct TestNode {
    pub agent: NodeAgent,
    pub capability: Arc<MockCapability>,
}

impl TestNode {
    pub fn new(addr: SocketAddr, node_id: &str) -> Self {
        let mut config = AgentConfig::new(addr.to_string(), node_id);
        config.reconnect_interval = Duration::from_millis(50);

        let capability = MockCapability::new();
        let agent = NodeAgent::new(config, capability.clone(), registry());
        let _ = capability.agent.set(agent.clone());

        Self { agent, capability }
    }

    /// Start the agent and wait until the orchestrator lists it as
    /// identified
    pub async fn start(addr: SocketAddr, node_id: &str, orchestrator: &Orchestrator) -> Self {
        let node = Self::new(addr, node_id);
        node.agent.start();
        assert!(
            wait_until(Duration::from_secs(5), || {
                status_of(orchestrator, node_id).is_some_and(|s| s.connected && s.session_established)
            })
            .await,
            "node {node_id} never identified"
        );
        node
    }
}

/// Launcher that brings up in-process test nodes
pub struct TestLauncher {
    addr: OnceLock<SocketAddr>,
    counter: AtomicU32,
    pub nodes: Mutex<Vec<TestNode>>,
}

impl TestLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            addr: OnceLock::new(),
            counter: AtomicU32::new(0),
            nodes: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, addr: SocketAddr) {
        let _ = self.addr.set(addr);
    }

    pub fn launched(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeLauncher for TestLauncher {
    async fn launch_new_node(&self) -> Result<String, OrchestratorError> {
        let addr = *self
            .addr
            .get()
            .ok_or_else(|| OrchestratorError::Config("launcher not attached".to_string()))?;

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let node_id = format!("launched-{n}");
        let node = TestNode::new(addr, &node_id);
        node.agent.start();
        self.nodes.lock().unwrap().push(node);
        Ok(node_id)
    }

    async fn launch_version(&self) -> Result<String, OrchestratorError> {
        Ok("test-build".to_string())
    }
}

/// Build and start an orchestrator, returning it with its bound address
pub async fn start_orchestrator(
    config: OrchestratorConfig,
    launcher: Option<Arc<TestLauncher>>,
) -> (Orchestrator, SocketAddr) {
    let mut builder = Orchestrator::builder(config);
    if let Some(launcher) = launcher.clone() {
        builder = builder.node_launcher(launcher);
    }
    let orchestrator = builder.build();
    let addr = orchestrator.start().await.expect("orchestrator starts");

    if let Some(launcher) = launcher {
        launcher.attach(addr);
    }
    (orchestrator, addr)
}
