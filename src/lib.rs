//! Arrakis shard orchestrator
//!
//! Coordinates a fleet of gateway nodes over a small framed TCP protocol:
//! - Assigns shards to nodes and restarts shards that went missing
//! - Moves shards between nodes with their resume state (live migration)
//! - Relays node-defined user events during a migration
//! - Exposes an operator HTTP API with health, readiness and Prometheus metrics
//!
//! The node side of the protocol lives in [`node`].

pub mod api;
pub mod config;
pub mod error;
pub mod nats;
pub mod node;
pub mod orchestrator;
pub mod protocol;
pub mod shard;
pub mod telemetry;
pub mod transport;
