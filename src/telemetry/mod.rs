//! Prometheus metrics
//!
//! `OrchestratorMetrics` owns the exporter handle and is installed once by
//! the binary. The recording functions go through the global `metrics`
//! facade, so they are no-ops in library use and tests where no recorder is
//! installed.

use crate::error::OrchestratorError;
use crate::protocol::EventType;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Installed Prometheus recorder
#[derive(Clone)]
pub struct OrchestratorMetrics {
    handle: PrometheusHandle,
}

impl OrchestratorMetrics {
    /// Install the global recorder and describe all metrics
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Self::register_metrics();
        Ok(Self { handle })
    }

    fn register_metrics() {
        describe_counter!(
            "orchestrator_messages_received_total",
            Unit::Count,
            "Control messages received from nodes"
        );
        describe_counter!(
            "orchestrator_user_events_relayed_total",
            Unit::Count,
            "User events relayed between migration participants"
        );
        describe_counter!(
            "orchestrator_migrations_started_total",
            Unit::Count,
            "Shard migrations started"
        );
        describe_counter!(
            "orchestrator_migrations_completed_total",
            Unit::Count,
            "Shard migrations acknowledged by the destination"
        );
        describe_counter!(
            "orchestrator_migrations_reaped_total",
            Unit::Count,
            "Stalled migrations forced back to none"
        );
        describe_counter!(
            "orchestrator_node_launches_total",
            Unit::Count,
            "Node launch attempts"
        );
        describe_counter!(
            "orchestrator_monitor_shard_starts_total",
            Unit::Count,
            "Shards started by the reconciliation monitor"
        );
        describe_counter!(
            "orchestrator_errors_total",
            Unit::Count,
            "Orchestrator errors"
        );

        describe_gauge!(
            "orchestrator_nodes_connected",
            Unit::Count,
            "Nodes with an open control connection"
        );
        describe_gauge!(
            "orchestrator_shards_running",
            Unit::Count,
            "Shards reported running by connected nodes"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

pub fn record_message_received(event: EventType) {
    counter!("orchestrator_messages_received_total", "event" => event.name()).increment(1);
}

pub fn record_user_event_relayed() {
    counter!("orchestrator_user_events_relayed_total").increment(1);
}

pub fn record_migration_started() {
    counter!("orchestrator_migrations_started_total").increment(1);
}

pub fn record_migration_completed() {
    counter!("orchestrator_migrations_completed_total").increment(1);
}

pub fn record_migration_reaped() {
    counter!("orchestrator_migrations_reaped_total").increment(1);
}

/// `outcome` is `ok` or `error`
pub fn record_node_launch(outcome: &'static str) {
    counter!("orchestrator_node_launches_total", "outcome" => outcome).increment(1);
}

pub fn record_monitor_shard_starts(count: usize) {
    counter!("orchestrator_monitor_shard_starts_total").increment(count as u64);
}

pub fn record_error(err: &OrchestratorError) {
    counter!("orchestrator_errors_total", "error_type" => err.error_type_label()).increment(1);
}

pub fn set_fleet_size(connected_nodes: usize, running_shards: usize) {
    gauge!("orchestrator_nodes_connected").set(connected_nodes as f64);
    gauge!("orchestrator_shards_running").set(running_shards as f64);
}
