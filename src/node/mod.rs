//! Worker side of the control channel

mod agent;
mod capability;

pub use agent::{AgentPhase, NodeAgent};
pub use capability::{NodeCapability, SessionInfo};
