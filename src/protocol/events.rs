//! Control-channel event ids and payload shapes
//!
//! Ids are fixed on the wire and shared with every node build, so they are
//! never renumbered. Everything below `USER_EVENT_START` is a control event
//! owned by this crate; everything at or above it belongs to the application
//! layered on top (see `UserEventRegistry`).

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Behaviour/protocol revision both sides must agree on during identify.
pub const LOGIC_VERSION: u32 = 2;

/// First id available to user events.
pub const USER_EVENT_START: u32 = 100;

/// A protocol event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// node -> orchestrator: announce the node, answered with `Identified`
    Identify,
    /// orchestrator -> node: session established
    Identified,
    /// orchestrator -> node: terminate the process
    Shutdown,
    /// orchestrator -> node: start these shards; echoed back as the ack
    StartShards,
    /// orchestrator -> node: stop this shard; echoed back as the ack
    StopShard,
    /// both directions during a handoff, see `PrepareShardMigrationData`
    PrepareShardMigration,
    /// orchestrator -> origin node: begin emitting user data for the shard
    StartShardMigration,
    /// origin -> orchestrator -> destination: total number of user events
    AllUserDataSent,
    /// application-defined event, relayed without interpretation
    User(u32),
}

impl EventType {
    /// Numeric id used in the frame header
    pub fn id(self) -> u32 {
        match self {
            Self::Identify => 1,
            Self::Identified => 2,
            Self::Shutdown => 3,
            Self::StartShards => 10,
            Self::StopShard => 11,
            Self::PrepareShardMigration => 20,
            Self::StartShardMigration => 21,
            Self::AllUserDataSent => 23,
            Self::User(id) => id,
        }
    }

    /// Map a frame header id back to an event type.
    ///
    /// Ids at or above `USER_EVENT_START` always map to `User`; whether that
    /// id is registered is decided by the receiving application.
    pub fn from_id(id: u32) -> Result<Self, ProtocolError> {
        let evt = match id {
            1 => Self::Identify,
            2 => Self::Identified,
            3 => Self::Shutdown,
            10 => Self::StartShards,
            11 => Self::StopShard,
            20 => Self::PrepareShardMigration,
            21 => Self::StartShardMigration,
            23 => Self::AllUserDataSent,
            id if id >= USER_EVENT_START => Self::User(id),
            id => return Err(ProtocolError::UnknownEvent(id)),
        };
        Ok(evt)
    }

    pub fn is_user(self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Static name, used as a metrics label
    pub fn name(self) -> &'static str {
        match self {
            Self::Identify => "Identify",
            Self::Identified => "Identified",
            Self::Shutdown => "Shutdown",
            Self::StartShards => "StartShards",
            Self::StopShard => "StopShard",
            Self::PrepareShardMigration => "PrepareShardMigration",
            Self::StartShardMigration => "StartShardMigration",
            Self::AllUserDataSent => "AllUserDataSent",
            Self::User(_) => "UserEvent",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "UserEvent({id})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyData {
    pub node_id: String,
    /// Total shards the node last knew about, 0 on first boot
    pub total_shards: u32,
    pub running_shards: Vec<u32>,
    pub version: String,
    pub logic_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedData {
    pub node_id: String,
    pub total_shards: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartShardsData {
    pub shard_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopShardData {
    pub shard_id: u32,
}

/// Carries the resume state from the origin to the destination.
///
/// The orchestrator sends it with `origin = true` and empty resume fields;
/// the origin echoes it with the fields filled in; the orchestrator flips
/// `origin` and forwards it to the destination, which echoes it once ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareShardMigrationData {
    pub origin: bool,
    pub shard_id: u32,
    pub session_id: String,
    pub sequence: u64,
    pub resume_gateway_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartShardMigrationData {
    pub shard_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllUserDataSentData {
    pub num_events: u64,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Identify(IdentifyData),
    Identified(IdentifiedData),
    Shutdown,
    StartShards(StartShardsData),
    StopShard(StopShardData),
    PrepareShardMigration(PrepareShardMigrationData),
    StartShardMigration(StartShardMigrationData),
    AllUserDataSent(AllUserDataSentData),
    /// Opaque user payload, forwarded byte-for-byte
    User { event_id: u32, payload: Vec<u8> },
}

impl Message {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Identify(_) => EventType::Identify,
            Self::Identified(_) => EventType::Identified,
            Self::Shutdown => EventType::Shutdown,
            Self::StartShards(_) => EventType::StartShards,
            Self::StopShard(_) => EventType::StopShard,
            Self::PrepareShardMigration(_) => EventType::PrepareShardMigration,
            Self::StartShardMigration(_) => EventType::StartShardMigration,
            Self::AllUserDataSent(_) => EventType::AllUserDataSent,
            Self::User { event_id, .. } => EventType::User(*event_id),
        }
    }
}
