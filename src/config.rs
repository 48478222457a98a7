//! Orchestrator and node agent configuration
//!
//! Loaded from environment variables (and a `.env` file if present).
//! Every timing constant of the orchestration loops lives here with its
//! production default so tests can shrink them.

use crate::error::OrchestratorError;
use crate::shard::BucketLayout;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator process configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address nodes connect to
    pub listen_addr: String,

    /// Operator API / health / metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Bot token, enables the Discord recommended shard count provider
    pub discord_token: Option<String>,

    /// NATS server URL(s) for roster publication
    pub nats_url: Option<String>,

    /// Pinned total shard count (required for multi-host mode)
    pub fixed_total_shards: Option<u32>,

    /// Shards this orchestrator reconciles; empty means all of them
    pub responsible_for_shards: Vec<u32>,

    /// Skip waiting for a node to report a shard count before fetching one
    pub skip_startup_grace: bool,

    /// How long the first shard-less identify waits for another node to
    /// supply the total shard count
    pub startup_grace: Duration,

    /// Pause between failed shard count fetches during identify
    pub shard_count_retry: Duration,

    pub monitor: MonitorConfig,
    pub migration: MigrationConfig,
    pub launcher: Option<LauncherConfig>,
    pub updater: Option<UpdaterConfig>,
}

/// Reconciliation monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Master switch, the monitor is a no-op when false
    pub ensure_all_shards_running: bool,

    /// Delay before the first tick, gives existing nodes time to re-identify
    pub initial_delay: Duration,

    pub tick_interval: Duration,

    /// Time a shard may be unseen before it is restarted, `None` disables
    /// restarts
    pub max_node_downtime: Option<Duration>,

    /// Capacity limit for automatic assignment only
    pub max_shards_per_node: usize,

    pub layout: BucketLayout,

    /// Minimum spacing between two bucket starts
    pub bucket_start_interval: Duration,

    /// Minimum spacing between two node launches
    pub node_launch_cooldown: Duration,

    /// Force stalled migrations back to `none` after this long, `None`
    /// leaves them for an operator
    pub migration_stall_timeout: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ensure_all_shards_running: false,
            initial_delay: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            max_node_downtime: Some(Duration::from_secs(10)),
            max_shards_per_node: 10,
            layout: BucketLayout::default(),
            bucket_start_interval: Duration::from_secs(5),
            node_launch_cooldown: Duration::from_secs(30),
            migration_stall_timeout: None,
        }
    }
}

/// Full-node and fleet migration pacing
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Poll interval while waiting for a shard to leave the origin
    pub origin_poll_interval: Duration,

    /// Poll interval while waiting for the destination to take over
    pub poll_interval: Duration,

    /// Upper bound for one shard's migration wait, `None` waits forever
    pub max_wait: Option<Duration>,

    /// Pause between two shards of a full node migration
    pub shard_settle_delay: Duration,

    /// Pause between two nodes of a fleet migration
    pub node_settle_delay: Duration,

    /// Poll interval while looking for an empty node
    pub node_poll_interval: Duration,

    /// Minimum spacing between launches while looking for an empty node
    pub launch_cooldown: Duration,

    /// Launch attempts before giving up on finding an empty node
    pub max_launch_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            origin_poll_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            max_wait: None,
            shard_settle_delay: Duration::from_secs(1),
            node_settle_delay: Duration::from_secs(5),
            node_poll_interval: Duration::from_secs(1),
            launch_cooldown: Duration::from_secs(60),
            max_launch_attempts: 5,
        }
    }
}

/// Process-based node launcher settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub cmd: String,
    pub args: Vec<String>,
    pub version_cmd: Option<String>,
    pub version_args: Vec<String>,
}

/// Command that pulls a new node build and prints its version last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    pub cmd: String,
    pub args: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7447".to_string(),
            http_port: 7448,
            log_level: "info".to_string(),
            discord_token: None,
            nats_url: None,
            fixed_total_shards: None,
            responsible_for_shards: Vec::new(),
            skip_startup_grace: false,
            startup_grace: Duration::from_secs(10),
            shard_count_retry: Duration::from_secs(1),
            monitor: MonitorConfig::default(),
            migration: MigrationConfig::default(),
            launcher: None,
            updater: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, OrchestratorError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OrchestratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let monitor_defaults = MonitorConfig::default();
        let migration_defaults = MigrationConfig::default();

        let max_node_downtime = match parse_opt::<i64, _>(&lookup, "MAX_NODE_DOWNTIME_SECS")? {
            Some(secs) if secs < 0 => None,
            Some(secs) => Some(Duration::from_secs(secs as u64)),
            None => monitor_defaults.max_node_downtime,
        };

        let monitor = MonitorConfig {
            ensure_all_shards_running: parse_bool(&lookup, "ENSURE_ALL_SHARDS_RUNNING", false)?,
            max_node_downtime,
            max_shards_per_node: parse_or(
                &lookup,
                "MAX_SHARDS_PER_NODE",
                monitor_defaults.max_shards_per_node,
            )?,
            layout: BucketLayout::new(
                parse_or(&lookup, "SHARD_BUCKET_SIZE", 0)?,
                parse_or(&lookup, "BUCKETS_PER_NODE", 0)?,
            ),
            migration_stall_timeout: parse_opt::<u64, _>(&lookup, "MIGRATION_STALL_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            ..monitor_defaults
        };

        let migration = MigrationConfig {
            poll_interval: parse_opt::<u64, _>(&lookup, "MIGRATION_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(migration_defaults.poll_interval),
            max_wait: parse_opt::<u64, _>(&lookup, "MIGRATION_MAX_WAIT_SECS")?
                .map(Duration::from_secs),
            ..migration_defaults
        };

        let launcher = lookup("NODE_LAUNCH_CMD").map(|cmd| LauncherConfig {
            cmd,
            args: split_args(lookup("NODE_LAUNCH_ARGS")),
            version_cmd: lookup("NODE_VERSION_CMD"),
            version_args: split_args(lookup("NODE_VERSION_ARGS")),
        });

        let updater = lookup("VERSION_PULL_CMD").map(|cmd| UpdaterConfig {
            cmd,
            args: split_args(lookup("VERSION_PULL_ARGS")),
        });

        let responsible_for_shards = match lookup("RESPONSIBLE_FOR_SHARDS") {
            Some(list) => parse_shard_list(&list)?,
            None => Vec::new(),
        };

        Ok(Self {
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            http_port: parse_or(&lookup, "HTTP_PORT", defaults.http_port)?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            discord_token: lookup("DISCORD_TOKEN").or_else(|| lookup("DISCORD_BOT_TOKEN")),
            nats_url: lookup("NATS_URL"),
            fixed_total_shards: parse_opt::<u32, _>(&lookup, "FIXED_TOTAL_SHARDS")?
                .filter(|&n| n > 0),
            responsible_for_shards,
            skip_startup_grace: parse_bool(&lookup, "SKIP_STARTUP_GRACE", false)?,
            startup_grace: defaults.startup_grace,
            shard_count_retry: defaults.shard_count_retry,
            monitor,
            migration,
            launcher,
            updater,
        })
    }
}

/// Node agent configuration, read inside worker processes
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub orchestrator_addr: String,
    pub node_id: String,
    pub version: String,
    pub reconnect_interval: Duration,
}

impl AgentConfig {
    pub fn new(orchestrator_addr: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            orchestrator_addr: orchestrator_addr.into(),
            node_id: node_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            reconnect_interval: Duration::from_secs(5),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, OrchestratorError> {
        dotenvy::dotenv().ok();

        let node_id = env::var("NODE_ID")
            .map_err(|_| OrchestratorError::Config("NODE_ID must be set".to_string()))?;
        let addr = env::var("ORCHESTRATOR_ADDR").unwrap_or_else(|_| "127.0.0.1:7447".to_string());

        let mut config = Self::new(addr, node_id);
        if let Ok(version) = env::var("NODE_VERSION") {
            config.version = version;
        }
        Ok(config)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, OrchestratorError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>, OrchestratorError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| OrchestratorError::Config(format!("{key} is invalid: {e}"))),
        _ => Ok(None),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, OrchestratorError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => Err(OrchestratorError::Config(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_shard_list(raw: &str) -> Result<Vec<u32>, OrchestratorError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|e| {
                OrchestratorError::Config(format!("RESPONSIBLE_FOR_SHARDS entry '{s}': {e}"))
            })
        })
        .collect()
}

fn split_args(raw: Option<String>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
