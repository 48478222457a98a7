//! Operator HTTP API
//!
//! Health, readiness and metrics endpoints plus a thin JSON façade over the
//! orchestrator's operator methods. Unauthenticated; bind it to a private
//! interface only.

use crate::error::OrchestratorError;
use crate::nats::RosterPublisher;
use crate::orchestrator::{NodeStatus, Orchestrator};
use crate::telemetry::OrchestratorMetrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub total_shards: Option<u32>,
    pub nodes_connected: usize,
    pub nats_connected: bool,
}

/// Full fleet status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub total_shards: Option<u32>,
    pub nodes: Vec<NodeStatus>,
}

/// A node process started by the launcher that is still running
#[derive(Debug, Serialize)]
pub struct LaunchedNodeResponse {
    pub node_id: String,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
}

/// Outcome of an operator command
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BasicResponse {
    pub message: String,
    pub error: bool,
}

#[derive(Debug, Deserialize)]
pub struct NodeRequest {
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MigrateNodeRequest {
    pub origin_node: String,
    pub destination_node: String,
    #[serde(default)]
    pub shutdown: bool,
}

#[derive(Debug, Deserialize)]
pub struct MigrateShardRequest {
    pub shard_id: u32,
    pub destination_node: String,
}

#[derive(Debug, Deserialize)]
pub struct ShardRequest {
    pub shard_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct StartShardsRequest {
    pub node_id: String,
    pub shard_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct FullMigrationRequest {
    /// Abort on the first failed node
    #[serde(default = "default_return_on_error")]
    pub return_on_error: bool,
}

fn default_return_on_error() -> bool {
    true
}

/// Application state for the API
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub metrics: Option<OrchestratorMetrics>,
    pub nats: Option<Arc<RosterPublisher>>,
}

/// Orchestrator error rendered as a `BasicResponse`
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::UnknownFromNode
            | OrchestratorError::UnknownToNode
            | OrchestratorError::UnknownNode(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NodeBusy(_)
            | OrchestratorError::ShardAlreadyRunning(_)
            | OrchestratorError::NodeNotConnected(_)
            | OrchestratorError::FullMigrationInProgress => StatusCode::CONFLICT,
            OrchestratorError::NoVersionUpdater => StatusCode::BAD_REQUEST,
            err if err.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(error = %self.0, status = status.as_u16(), "Operator command failed");
        (
            status,
            Json(BasicResponse {
                message: self.0.to_string(),
                error: true,
            }),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<BasicResponse>, ApiError>;

fn ok(message: impl Into<String>) -> ApiResult {
    Ok(Json(BasicResponse {
        message: message.into(),
        error: false,
    }))
}

/// Create the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/nodes/launched", get(launched_nodes_handler))
        .route("/nodes/start", post(start_node_handler))
        .route("/nodes/shutdown", post(shutdown_node_handler))
        .route("/nodes/blacklist", post(blacklist_node_handler))
        .route("/nodes/remove", post(remove_node_handler))
        .route("/nodes/migrate", post(migrate_node_handler))
        .route("/shards/migrate", post(migrate_shard_handler))
        .route("/shards/stop", post(stop_shard_handler))
        .route("/shards/start", post(start_shards_handler))
        .route("/migrations/full", post(full_migration_handler))
        .route("/migrations/full/cancel", post(cancel_full_migration_handler))
        .route("/total-shards/reset", post(reset_total_shards_handler))
        .route("/version/deployed", get(deployed_version_handler))
        .route("/version/pull", post(pull_version_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 once the total shard count is known
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let total_shards = state.orchestrator.total_shards();
    let nodes_connected = state
        .orchestrator
        .get_full_nodes_status()
        .iter()
        .filter(|s| s.connected)
        .count();
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());

    let response = ReadyResponse {
        ready: total_shards.is_some(),
        total_shards,
        nodes_connected,
        nats_connected,
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            metrics.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        total_shards: state.orchestrator.total_shards(),
        nodes: state.orchestrator.get_full_nodes_status(),
    })
}

async fn launched_nodes_handler(State(state): State<AppState>) -> Json<Vec<LaunchedNodeResponse>> {
    let mut nodes: Vec<LaunchedNodeResponse> = state
        .orchestrator
        .launched_nodes()
        .into_iter()
        .map(|(node_id, launched)| LaunchedNodeResponse {
            node_id,
            pid: launched.pid,
            uptime_secs: launched.launched_at.elapsed().as_secs(),
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(nodes)
}

async fn start_node_handler(State(state): State<AppState>) -> ApiResult {
    let node_id = state.orchestrator.start_new_node().await?;
    ok(format!("started a new node: {node_id}"))
}

async fn shutdown_node_handler(
    State(state): State<AppState>,
    Json(req): Json<NodeRequest>,
) -> ApiResult {
    info!(node_id = %req.node_id, "API: shutting down node");
    state.orchestrator.shutdown_node(&req.node_id).await?;
    ok("sent shutdown to node")
}

async fn blacklist_node_handler(
    State(state): State<AppState>,
    Json(req): Json<NodeRequest>,
) -> ApiResult {
    state.orchestrator.blacklist_node(&req.node_id);
    ok(format!("blacklisted node {}", req.node_id))
}

async fn remove_node_handler(
    State(state): State<AppState>,
    Json(req): Json<NodeRequest>,
) -> ApiResult {
    state.orchestrator.remove_node(&req.node_id).await?;
    ok(format!("removed node {}", req.node_id))
}

async fn migrate_node_handler(
    State(state): State<AppState>,
    Json(req): Json<MigrateNodeRequest>,
) -> ApiResult {
    state
        .orchestrator
        .migrate_full_node(&req.origin_node, &req.destination_node, req.shutdown)
        .await?;
    ok(format!(
        "migrated node {} to {}",
        req.origin_node, req.destination_node
    ))
}

async fn migrate_shard_handler(
    State(state): State<AppState>,
    Json(req): Json<MigrateShardRequest>,
) -> ApiResult {
    state
        .orchestrator
        .start_shard_migration(&req.destination_node, req.shard_id)
        .await?;
    ok("started shard migration")
}

async fn stop_shard_handler(
    State(state): State<AppState>,
    Json(req): Json<ShardRequest>,
) -> ApiResult {
    state.orchestrator.stop_shard(req.shard_id).await?;
    ok("sent stop shard")
}

async fn start_shards_handler(
    State(state): State<AppState>,
    Json(req): Json<StartShardsRequest>,
) -> ApiResult {
    state
        .orchestrator
        .start_shards(&req.node_id, &req.shard_ids)
        .await?;
    ok(format!("started shards {:?} on {}", req.shard_ids, req.node_id))
}

async fn full_migration_handler(
    State(state): State<AppState>,
    Json(req): Json<FullMigrationRequest>,
) -> ApiResult {
    let cancel = state.orchestrator.full_migration_cancel();
    state
        .orchestrator
        .migrate_all_nodes_to_new_nodes(req.return_on_error, cancel)
        .await?;
    ok("migrated all nodes to new nodes")
}

async fn cancel_full_migration_handler(State(state): State<AppState>) -> ApiResult {
    if state.orchestrator.cancel_full_migration() {
        ok("cancelling full migration")
    } else {
        ok("no full migration running")
    }
}

async fn reset_total_shards_handler(State(state): State<AppState>) -> ApiResult {
    state.orchestrator.reset_total_shards();
    ok("reset total shard count")
}

async fn deployed_version_handler(State(state): State<AppState>) -> ApiResult {
    let version = state.orchestrator.launch_version().await?;
    ok(version)
}

async fn pull_version_handler(State(state): State<AppState>) -> ApiResult {
    info!("API: pulling new node version");
    let version = state.orchestrator.pull_new_version().await?;
    ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::{LaunchedNode, NodeLauncher, VersionUpdater};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn state() -> AppState {
        with_orchestrator(Orchestrator::new(OrchestratorConfig::default()))
    }

    fn with_orchestrator(orchestrator: Orchestrator) -> AppState {
        AppState {
            orchestrator,
            metrics: None,
            nats: None,
        }
    }

    struct FakeUpdater {
        pulls: AtomicU32,
    }

    #[async_trait]
    impl VersionUpdater for FakeUpdater {
        async fn pull_new_version(&self) -> Result<String, OrchestratorError> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("build-{n}"))
        }
    }

    struct FakeLauncher;

    #[async_trait]
    impl NodeLauncher for FakeLauncher {
        async fn launch_new_node(&self) -> Result<String, OrchestratorError> {
            Ok("node-x".to_string())
        }

        async fn launch_version(&self) -> Result<String, OrchestratorError> {
            Ok("build-1".to_string())
        }

        fn launched_nodes(&self) -> Vec<(String, LaunchedNode)> {
            let launched_at = Instant::now();
            vec![
                ("node-y".to_string(), LaunchedNode { pid: None, launched_at }),
                (
                    "node-x".to_string(),
                    LaunchedNode {
                        pid: Some(4242),
                        launched_at,
                    },
                ),
            ]
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.2.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |err| ApiError(err).status();
        assert_eq!(status(OrchestratorError::UnknownToNode), StatusCode::NOT_FOUND);
        assert_eq!(
            status(OrchestratorError::NodeBusy("a".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(OrchestratorError::FromNodeNotRunningShard {
                node_id: "a".to_string(),
                shard_id: 1
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(OrchestratorError::NodeNotConnected("b".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(OrchestratorError::NoVersionUpdater),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(OrchestratorError::NoNodeLauncher),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_request_defaults() {
        let req: MigrateNodeRequest =
            serde_json::from_str(r#"{"origin_node":"a","destination_node":"b"}"#).unwrap();
        assert!(!req.shutdown);

        let req: FullMigrationRequest = serde_json::from_str("{}").unwrap();
        assert!(req.return_on_error);
    }

    #[tokio::test]
    async fn test_ready_before_total_shards_known() {
        let response = ready_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["ready"], false);
        assert!(json["total_shards"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_node_is_reported_as_error() {
        let response = shutdown_node_handler(
            State(state()),
            Json(NodeRequest {
                node_id: "ghost".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], true);
        assert_eq!(json["message"], "unknown node ghost");
    }

    #[tokio::test]
    async fn test_blacklist_command() {
        let state = state();
        let Json(response) = blacklist_node_handler(
            State(state.clone()),
            Json(NodeRequest {
                node_id: "node-a".to_string(),
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("blacklist failed"));

        assert!(!response.error);
        assert!(state.orchestrator.is_blacklisted("node-a"));
    }

    #[tokio::test]
    async fn test_pull_version_without_updater() {
        let response = pull_version_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], true);
        assert_eq!(json["message"], "no version updater configured");
    }

    #[tokio::test]
    async fn test_pull_version_reports_new_version() {
        let updater = Arc::new(FakeUpdater {
            pulls: AtomicU32::new(0),
        });
        let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
            .version_updater(updater.clone())
            .build();
        let state = with_orchestrator(orchestrator);

        let Json(response) = pull_version_handler(State(state.clone()))
            .await
            .unwrap_or_else(|_| panic!("pull failed"));
        assert_eq!(
            response,
            BasicResponse {
                message: "build-1".to_string(),
                error: false,
            }
        );

        let Json(response) = pull_version_handler(State(state))
            .await
            .unwrap_or_else(|_| panic!("pull failed"));
        assert_eq!(response.message, "build-2");
        assert_eq!(updater.pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_launched_nodes_listing() {
        let Json(nodes) = launched_nodes_handler(State(state())).await;
        assert!(nodes.is_empty());

        let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
            .node_launcher(Arc::new(FakeLauncher))
            .build();
        let response = launched_nodes_handler(State(with_orchestrator(orchestrator)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json[0]["node_id"], "node-x");
        assert_eq!(json[0]["pid"], 4242);
        assert_eq!(json[1]["node_id"], "node-y");
        assert!(json[1]["pid"].is_null());
        assert_eq!(json[1]["uptime_secs"], 0);
    }

    #[tokio::test]
    async fn test_cancel_without_full_migration() {
        let Json(response) = cancel_full_migration_handler(State(state()))
            .await
            .unwrap_or_else(|_| panic!("cancel failed"));
        assert!(!response.error);
        assert_eq!(response.message, "no full migration running");
    }
}
