//! Control-channel transport
//!
//! Wraps a TCP stream into ordered, framed message delivery. Used the same
//! way by the orchestrator (one per accepted node) and by the node agent.

mod conn;

pub use conn::{Connection, MessageHandler};
