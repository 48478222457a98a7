//! Control-channel wire protocol
//!
//! Event ids, payload shapes, frame encoding and the user event registry
//! shared by the orchestrator and the node agent.

pub mod codec;
pub mod events;
pub mod registry;

pub use codec::{decode_message, encode_frame, encode_message, read_frame};
pub use events::{
    AllUserDataSentData, EventType, IdentifiedData, IdentifyData, Message,
    PrepareShardMigrationData, StartShardMigrationData, StartShardsData, StopShardData,
    LOGIC_VERSION, USER_EVENT_START,
};
pub use registry::{UserEventRegistry, UserPayload};
