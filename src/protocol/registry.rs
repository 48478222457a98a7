//! User event registry
//!
//! Applications register their own event ids (>= 100) with a payload type
//! before any connection is opened. The registry is then frozen behind an
//! `Arc` and only read, so it needs no locking.

use crate::error::ProtocolError;
use crate::protocol::codec::encode_payload;
use crate::protocol::events::{Message, USER_EVENT_START};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;

/// A decoded user payload. Downcast to the type it was registered with.
pub type UserPayload = Box<dyn Any + Send>;

type DecodeFn = fn(&[u8]) -> Result<UserPayload, rmp_serde::decode::Error>;

fn decode_boxed<T>(body: &[u8]) -> Result<UserPayload, rmp_serde::decode::Error>
where
    T: DeserializeOwned + Send + 'static,
{
    Ok(Box::new(rmp_serde::from_slice::<T>(body)?))
}

struct Registration {
    name: String,
    decode: DecodeFn,
}

/// Maps user event ids to a name and a payload decoder
#[derive(Default)]
pub struct UserEventRegistry {
    events: HashMap<u32, Registration>,
}

impl UserEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user event carrying payloads of type `T`
    pub fn register<T>(&mut self, event_id: u32, name: &str) -> Result<(), ProtocolError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if event_id < USER_EVENT_START {
            return Err(ProtocolError::ReservedEventId {
                id: event_id,
                min: USER_EVENT_START,
            });
        }

        if self.events.contains_key(&event_id) {
            return Err(ProtocolError::DuplicateUserEvent(event_id));
        }

        self.events.insert(
            event_id,
            Registration {
                name: format!("UserEvt:{name}"),
                decode: decode_boxed::<T>,
            },
        );
        Ok(())
    }

    pub fn contains(&self, event_id: u32) -> bool {
        self.events.contains_key(&event_id)
    }

    pub fn name(&self, event_id: u32) -> Option<&str> {
        self.events.get(&event_id).map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decode a user event body.
    ///
    /// An empty body is a payload-less event and yields `()`.
    pub fn decode(&self, event_id: u32, body: &[u8]) -> Result<UserPayload, ProtocolError> {
        let registration = self
            .events
            .get(&event_id)
            .ok_or(ProtocolError::UnknownEvent(event_id))?;

        if body.is_empty() {
            return Ok(Box::new(()));
        }

        (registration.decode)(body).map_err(|source| ProtocolError::Decode {
            event: event_id,
            source,
        })
    }

    /// Encode a payload for a registered user event into a `Message`
    pub fn encode<T: Serialize>(&self, event_id: u32, data: &T) -> Result<Message, ProtocolError> {
        if !self.contains(event_id) {
            return Err(ProtocolError::UnknownEvent(event_id));
        }

        Ok(Message::User {
            event_id,
            payload: encode_payload(event_id, data)?,
        })
    }
}

impl std::fmt::Debug for UserEventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.events.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("UserEventRegistry").field("events", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct GuildState {
        guild_id: u64,
        members: Vec<String>,
    }

    #[test]
    fn register_rejects_control_range() {
        let mut registry = UserEventRegistry::new();
        let err = registry.register::<String>(99, "too-low").unwrap_err();
        assert!(matches!(err, ProtocolError::ReservedEventId { id: 99, min: 100 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = UserEventRegistry::new();
        registry.register::<String>(101, "a").unwrap();
        let err = registry.register::<u64>(101, "b").unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateUserEvent(101)));
        assert_eq!(registry.name(101), Some("UserEvt:a"));
    }

    #[test]
    fn encoded_payload_decodes_to_registered_type() {
        let mut registry = UserEventRegistry::new();
        registry.register::<GuildState>(150, "guild_state").unwrap();

        let state = GuildState {
            guild_id: 42,
            members: vec!["alice".to_string(), "bob".to_string()],
        };

        let Message::User { event_id, payload } = registry.encode(150, &state).unwrap() else {
            panic!("expected user message");
        };
        assert_eq!(event_id, 150);

        let decoded = registry.decode(150, &payload).unwrap();
        assert_eq!(decoded.downcast_ref::<GuildState>(), Some(&state));
    }

    #[test]
    fn unregistered_user_event_is_unknown() {
        let registry = UserEventRegistry::new();
        assert!(matches!(
            registry.decode(123, &[0xc0]),
            Err(ProtocolError::UnknownEvent(123))
        ));
        assert!(matches!(
            registry.encode(123, &"x"),
            Err(ProtocolError::UnknownEvent(123))
        ));
    }

    #[test]
    fn empty_body_decodes_to_unit() {
        let mut registry = UserEventRegistry::new();
        registry.register::<String>(101, "ping").unwrap();
        let decoded = registry.decode(101, &[]).unwrap();
        assert!(decoded.downcast_ref::<()>().is_some());
    }

    #[test]
    fn wrong_shape_fails_to_decode() {
        let mut registry = UserEventRegistry::new();
        registry.register::<GuildState>(150, "guild_state").unwrap();
        let body = rmp_serde::to_vec_named(&"just a string").unwrap();
        assert!(matches!(
            registry.decode(150, &body),
            Err(ProtocolError::Decode { event: 150, .. })
        ));
    }
}
