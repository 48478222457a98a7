//! Node process launching
//!
//! `NodeLauncher` is the seam the orchestrator uses to add capacity. The
//! process launcher starts the configured command with `-nodeid <id>`
//! appended and forwards the child's output into tracing.

use crate::config::LauncherConfig;
use crate::error::OrchestratorError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Node ids embed a millisecond timestamp, keep launches apart
const MIN_LAUNCH_SPACING: Duration = Duration::from_millis(100);

/// Starts node processes
#[async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    /// Launch a new node and return its id. Does not wait for it to connect.
    async fn launch_new_node(&self) -> Result<String, OrchestratorError>;

    /// Version of the node binary a launch would start
    async fn launch_version(&self) -> Result<String, OrchestratorError>;

    /// Launched nodes that are still running, if the launcher tracks them
    fn launched_nodes(&self) -> Vec<(String, LaunchedNode)> {
        Vec::new()
    }
}

/// A node process started by this launcher
#[derive(Debug, Clone, Copy)]
pub struct LaunchedNode {
    pub pid: Option<u32>,
    pub launched_at: Instant,
}

/// Launches nodes as local child processes
pub struct ProcessNodeLauncher {
    config: LauncherConfig,
    last_launch: Mutex<Option<Instant>>,
    children: Arc<DashMap<String, LaunchedNode>>,
}

impl ProcessNodeLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            last_launch: Mutex::new(None),
            children: Arc::new(DashMap::new()),
        }
    }

    async fn wait_for_launch_slot(&self) {
        let mut last = self.last_launch.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < MIN_LAUNCH_SPACING {
                tokio::time::sleep(MIN_LAUNCH_SPACING - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl NodeLauncher for ProcessNodeLauncher {
    async fn launch_new_node(&self) -> Result<String, OrchestratorError> {
        self.wait_for_launch_slot().await;

        let node_id = generate_node_id();

        let mut child = Command::new(&self.config.cmd)
            .args(&self.config.args)
            .arg("-nodeid")
            .arg(&node_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::NodeLaunch(Box::new(e)))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(node_id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(node_id.clone(), "stderr", stderr));
        }

        self.children.insert(
            node_id.clone(),
            LaunchedNode {
                pid: child.id(),
                launched_at: Instant::now(),
            },
        );

        let children = Arc::clone(&self.children);
        let id = node_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(node_id = %id, %status, "Node process exited"),
                Err(e) => warn!(node_id = %id, error = %e, "Failed waiting for node process"),
            }
            children.remove(&id);
        });

        info!(node_id = %node_id, cmd = %self.config.cmd, "Started node process");
        Ok(node_id)
    }

    async fn launch_version(&self) -> Result<String, OrchestratorError> {
        let cmd = self.config.version_cmd.as_deref().ok_or_else(|| {
            OrchestratorError::NodeLaunch("no version command configured".into())
        })?;

        let output = Command::new(cmd)
            .args(&self.config.version_args)
            .output()
            .await
            .map_err(|e| OrchestratorError::NodeLaunch(Box::new(e)))?;

        if !output.status.success() {
            return Err(OrchestratorError::NodeLaunch(
                format!("version command exited with {}", output.status).into(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Children that have not exited yet
    fn launched_nodes(&self) -> Vec<(String, LaunchedNode)> {
        self.children
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Forward a child's output line by line into tracing
async fn forward_output<R>(node_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(node_id = %node_id, stream, "{line}");
    }
}

/// `<host>-<base36 unix millis>`
fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{host}-{}", to_base36(millis))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
