//! Shard vocabulary
//!
//! Resume state, migration roles and bucket arithmetic shared by the
//! node agent, the orchestrator and the reconciliation monitor.

mod bucket;
mod state;

pub use bucket::BucketLayout;
pub use state::{MigrationRole, ResumeState, ShardMigration};
