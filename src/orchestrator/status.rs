//! Point-in-time node status snapshots

use serde::Serialize;

/// Snapshot of one node as seen by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub version: String,
    pub session_established: bool,
    pub shards: Vec<u32>,
    pub connected: bool,
    /// Unix milliseconds of the last disconnect
    pub disconnected_at: Option<u64>,
    pub blacklisted: bool,

    pub migrating_from: Option<String>,
    pub migrating_to: Option<String>,
    pub migrating_shard: Option<u32>,
}

impl NodeStatus {
    pub fn runs_shard(&self, shard_id: u32) -> bool {
        self.shards.contains(&shard_id)
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating_from.is_some() || self.migrating_to.is_some()
    }

    /// True if this node is mid-migration of exactly this shard
    pub fn is_migrating_shard(&self, shard_id: u32) -> bool {
        self.is_migrating() && self.migrating_shard == Some(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let status = NodeStatus {
            id: "node-a".to_string(),
            version: "0.2.0".to_string(),
            session_established: true,
            shards: vec![0, 1, 2],
            connected: true,
            migrating_to: Some("node-b".to_string()),
            migrating_shard: Some(2),
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "node-a");
        assert_eq!(json["shards"], serde_json::json!([0, 1, 2]));
        assert_eq!(json["migrating_to"], "node-b");
        assert!(json["migrating_from"].is_null());
        assert!(json["disconnected_at"].is_null());
    }

    #[test]
    fn test_migrating_shard_requires_role() {
        let mut status = NodeStatus {
            migrating_shard: Some(3),
            ..Default::default()
        };
        assert!(!status.is_migrating_shard(3));

        status.migrating_from = Some("node-a".to_string());
        assert!(status.is_migrating_shard(3));
        assert!(!status.is_migrating_shard(4));
    }
}
