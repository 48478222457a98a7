//! Reconciliation monitor
//!
//! Once per tick: make sure the total shard count is known, track when each
//! shard was last seen running, and restart shards that have been missing
//! longer than the downtime threshold. One node slot's batch is started per
//! `bucket_start_interval`; when no existing node can take it, a new node is
//! launched instead.

use crate::config::MonitorConfig;
use crate::orchestrator::{NodeStatus, Orchestrator};
use crate::shard::BucketLayout;
use crate::telemetry;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shards to start, keyed by node slot
pub(crate) type RestartPlan = BTreeMap<u32, Vec<u32>>;

pub(super) struct Monitor {
    orchestrator: Orchestrator,
    last_seen: BTreeMap<u32, Instant>,
    tracked_total: Option<u32>,
    last_bucket_start: Option<Instant>,
    last_node_launch: Option<Instant>,
}

impl Monitor {
    pub(super) fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            last_seen: BTreeMap::new(),
            tracked_total: None,
            last_bucket_start: None,
            last_node_launch: None,
        }
    }

    pub(super) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.orchestrator.config().monitor.clone();

        // Give existing nodes time to re-identify before launching anything
        tokio::select! {
            _ = tokio::time::sleep(config.initial_delay) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => return,
        }

        let mut ticker = tokio::time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&config).await,
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => break,
            }
        }
        debug!("Monitor stopped");
    }

    async fn tick(&mut self, config: &MonitorConfig) {
        if let Some(timeout) = config.migration_stall_timeout {
            self.reap_stalled_migrations(timeout).await;
        }

        if !config.ensure_all_shards_running {
            return;
        }

        let Some(total_shards) = self.orchestrator.ensure_total_shards().await else {
            return;
        };

        let now = Instant::now();
        if self.tracked_total != Some(total_shards) {
            self.last_seen = (0..total_shards).map(|s| (s, now)).collect();
            self.tracked_total = Some(total_shards);
        }

        let statuses = self.orchestrator.get_full_nodes_status();
        let running = refresh_last_seen(&mut self.last_seen, &statuses, now);

        if self
            .last_bucket_start
            .is_some_and(|t| now.duration_since(t) < config.bucket_start_interval)
        {
            return;
        }

        let Some(max_downtime) = config.max_node_downtime else {
            return;
        };

        let plan = plan_restarts(
            &self.last_seen,
            &running,
            &statuses,
            now,
            max_downtime,
            config.layout,
            |shard| self.orchestrator.is_responsible_for_shard(shard),
        );
        if plan.is_empty() {
            return;
        }

        let count: usize = plan.values().map(Vec::len).sum();
        info!(count, "Monitor needs to start shards");

        if let Some((node_id, shards)) =
            choose_assignment(&statuses, &plan, config.max_shards_per_node, config.layout)
        {
            info!(node_id = %node_id, shards = ?shards, "Monitor starting shards");
            match self.orchestrator.start_shards(&node_id, &shards).await {
                Ok(()) => telemetry::record_monitor_shard_starts(shards.len()),
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "Monitor failed starting shards");
                    telemetry::record_error(&e);
                }
            }
            self.last_bucket_start = Some(now);
            return;
        }

        // No node can take any slot, launch one
        if self
            .last_node_launch
            .is_some_and(|t| now.duration_since(t) < config.node_launch_cooldown)
        {
            debug!("Monitor can't start a new node yet, on cooldown");
            return;
        }

        match self.orchestrator.start_new_node().await {
            Ok(node_id) => {
                info!(node_id = %node_id, "Monitor launched a new node");
                self.last_node_launch = Some(now);
            }
            Err(e) => {
                error!(error = %e, "Monitor failed launching a new node");
            }
        }
    }

    /// Force migrations back to `none` once the role has been held longer
    /// than `timeout` and the other participant is gone or disconnected
    async fn reap_stalled_migrations(&self, timeout: Duration) {
        let nodes = self.orchestrator.cluster().nodes.clone();

        for node in nodes {
            let stalled = {
                let state = node.state();
                match (state.migration.started_at, state.migration.peer.clone()) {
                    (Some(started), Some(peer)) if state.migration.is_busy() => {
                        (started.elapsed() > timeout).then_some((peer, state.migration.shard))
                    }
                    _ => None,
                }
            };
            let Some((peer_id, shard_id)) = stalled else {
                continue;
            };

            let peer = self.orchestrator.find_node_by_id(&peer_id);
            if peer.as_ref().is_some_and(|p| p.is_connected()) {
                continue;
            }

            let node_id = node.id();
            node.state().migration.clear();
            if let Some(peer) = peer {
                let mut state = peer.state();
                if state.migration.peer.as_deref() == Some(node_id.as_str()) {
                    state.migration.clear();
                }
            }

            warn!(
                node_id = %node_id,
                peer = %peer_id,
                shard_id = ?shard_id,
                "Cleared stalled shard migration"
            );
            telemetry::record_migration_reaped();
        }
    }
}

/// Refresh last-seen times from connected, non-migrating nodes and return
/// every shard some connected node reports running
pub(crate) fn refresh_last_seen(
    last_seen: &mut BTreeMap<u32, Instant>,
    statuses: &[NodeStatus],
    now: Instant,
) -> HashSet<u32> {
    let mut running = HashSet::new();

    for status in statuses.iter().filter(|s| s.connected) {
        for &shard in &status.shards {
            running.insert(shard);
            if !status.is_migrating() {
                if let Some(seen) = last_seen.get_mut(&shard) {
                    *seen = now;
                }
            }
        }
    }

    running
}

/// Shards missing for longer than `max_downtime`, not mid-migration and
/// within this orchestrator's responsibility, grouped by node slot
pub(crate) fn plan_restarts(
    last_seen: &BTreeMap<u32, Instant>,
    running: &HashSet<u32>,
    statuses: &[NodeStatus],
    now: Instant,
    max_downtime: Duration,
    layout: BucketLayout,
    is_responsible: impl Fn(u32) -> bool,
) -> RestartPlan {
    let mut plan = RestartPlan::new();

    for (&shard, &seen) in last_seen {
        if running.contains(&shard) || now.duration_since(seen) < max_downtime {
            continue;
        }
        if statuses.iter().any(|s| s.is_migrating_shard(shard)) {
            continue;
        }
        if !is_responsible(shard) {
            continue;
        }

        plan.entry(layout.node_slot_for_shard(shard))
            .or_default()
            .push(shard);
    }

    plan
}

/// Pick the first eligible node and the slot it can take.
///
/// A node is eligible when connected, identified, not blacklisted and below
/// `max_shards_per_node`; it can take a slot when every shard it already
/// runs belongs to that slot. The batch is capped by the bucket size and
/// the node's spare capacity.
pub(crate) fn choose_assignment(
    statuses: &[NodeStatus],
    plan: &RestartPlan,
    max_shards_per_node: usize,
    layout: BucketLayout,
) -> Option<(String, Vec<u32>)> {
    for status in statuses {
        if !status.connected || !status.session_established || status.blacklisted {
            continue;
        }
        if status.shards.len() >= max_shards_per_node {
            continue;
        }

        let compatible = plan.iter().find(|(&slot, _)| {
            status
                .shards
                .iter()
                .all(|&s| layout.node_slot_for_shard(s) == slot)
        });
        let Some((_, shards)) = compatible else {
            continue;
        };

        let spare = max_shards_per_node - status.shards.len();
        let limit = layout.batch_limit().map_or(spare, |batch| batch.min(spare));
        let batch: Vec<u32> = shards.iter().copied().take(limit).collect();

        return Some((status.id.clone(), batch));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, shards: &[u32]) -> NodeStatus {
        NodeStatus {
            id: id.to_string(),
            session_established: true,
            connected: true,
            shards: shards.to_vec(),
            ..Default::default()
        }
    }

    fn stale_table(total: u32, now: Instant, age: Duration) -> BTreeMap<u32, Instant> {
        (0..total).map(|s| (s, now - age)).collect()
    }

    #[test]
    fn refresh_skips_disconnected_and_migrating_nodes() {
        let start = Instant::now();
        let now = start + Duration::from_secs(30);
        let mut last_seen: BTreeMap<u32, Instant> = (0..6).map(|s| (s, start)).collect();

        let mut disconnected = node("b", &[2, 3]);
        disconnected.connected = false;
        let mut migrating = node("c", &[4]);
        migrating.migrating_to = Some("a".to_string());

        let running = refresh_last_seen(
            &mut last_seen,
            &[node("a", &[0, 1]), disconnected, migrating],
            now,
        );

        assert_eq!(running, HashSet::from([0, 1, 4]));
        assert_eq!(last_seen[&0], now);
        assert_eq!(last_seen[&2], start);
        assert_eq!(last_seen[&4], start);
    }

    #[test]
    fn stale_shards_are_grouped_by_slot() {
        let now = Instant::now() + Duration::from_secs(60);
        let last_seen = stale_table(8, now, Duration::from_secs(30));
        let running = HashSet::from([0, 1]);

        let plan = plan_restarts(
            &last_seen,
            &running,
            &[],
            now,
            Duration::from_secs(10),
            BucketLayout::new(4, 0),
            |_| true,
        );

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[&0], vec![2, 3]);
        assert_eq!(plan[&1], vec![4, 5, 6, 7]);
    }

    #[test]
    fn recent_migrating_and_foreign_shards_are_not_restarted() {
        let now = Instant::now() + Duration::from_secs(60);
        let mut last_seen = stale_table(4, now, Duration::from_secs(30));
        last_seen.insert(1, now - Duration::from_secs(2));

        let mut destination = node("b", &[]);
        destination.migrating_from = Some("a".to_string());
        destination.migrating_shard = Some(2);

        let plan = plan_restarts(
            &last_seen,
            &HashSet::new(),
            &[destination],
            now,
            Duration::from_secs(10),
            BucketLayout::default(),
            |shard| shard != 3,
        );

        assert_eq!(plan[&0], vec![0]);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn assignment_prefers_first_eligible_compatible_node() {
        let layout = BucketLayout::new(4, 0);
        let plan: RestartPlan = BTreeMap::from([(0, vec![2, 3]), (1, vec![4, 5, 6, 7])]);

        let mut blacklisted = node("blacklisted", &[]);
        blacklisted.blacklisted = true;
        let mut unidentified = node("unidentified", &[]);
        unidentified.session_established = false;
        let full = node("full", &[8, 9]);
        let wrong_slot = node("wrong-slot", &[8]);
        let slot_zero = node("slot-zero", &[0, 1]);

        let statuses = [blacklisted, unidentified, full, wrong_slot, slot_zero];
        let (node_id, shards) = choose_assignment(&statuses, &plan, 2, layout)
            .or_else(|| choose_assignment(&statuses, &plan, 10, layout))
            .unwrap();

        assert_eq!(node_id, "slot-zero");
        assert_eq!(shards, vec![2, 3]);
    }

    #[test]
    fn empty_node_takes_first_slot_capped_by_bucket_and_capacity() {
        let plan: RestartPlan = BTreeMap::from([(0, (0..16).collect())]);

        let (_, shards) =
            choose_assignment(&[node("a", &[])], &plan, 10, BucketLayout::new(4, 4)).unwrap();
        assert_eq!(shards, vec![0, 1, 2, 3]);

        let (_, shards) =
            choose_assignment(&[node("a", &[])], &plan, 3, BucketLayout::default()).unwrap();
        assert_eq!(shards, vec![0, 1, 2]);
    }

    #[test]
    fn no_eligible_node_means_launch() {
        let plan: RestartPlan = BTreeMap::from([(0, vec![0])]);
        let mut offline = node("a", &[]);
        offline.connected = false;
        assert!(choose_assignment(&[offline], &plan, 10, BucketLayout::default()).is_none());
    }
}
