//! NATS integration
//!
//! Periodically publishes the connected node roster.

mod publisher;

pub use publisher::{Roster, RosterPublisher, ROSTER_INTERVAL, ROSTER_SUBJECT};
