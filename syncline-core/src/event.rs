//! Change events delivered by push channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityId, OwnerScope};
use crate::error::{SyncError, SyncResult};

/// Kind of server-side change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Event body: the full row for inserts and updates, the id for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePayload<T> {
    Entity(T),
    Id(EntityId),
}

/// A change pushed by the remote service for one owner scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    pub kind: ChangeKind,
    pub owner_scope: OwnerScope,
    pub payload: ChangePayload<T>,
    /// Server-assigned delivery id, when the transport provides one.
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Change event as it comes off the wire, before decoding into an entity type.
pub type RawChangeEvent = ChangeEvent<Value>;

impl<T: Entity> ChangeEvent<T> {
    pub fn insert(owner_scope: OwnerScope, entity: T) -> Self {
        Self {
            kind: ChangeKind::Insert,
            owner_scope,
            payload: ChangePayload::Entity(entity),
            event_id: None,
        }
    }

    pub fn update(owner_scope: OwnerScope, entity: T) -> Self {
        Self {
            kind: ChangeKind::Update,
            owner_scope,
            payload: ChangePayload::Entity(entity),
            event_id: None,
        }
    }

    pub fn delete(owner_scope: OwnerScope, id: impl Into<EntityId>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            owner_scope,
            payload: ChangePayload::Id(id.into()),
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Identity of the row this event concerns.
    pub fn entity_id(&self) -> EntityId {
        match &self.payload {
            ChangePayload::Entity(entity) => entity.entity_id(),
            ChangePayload::Id(id) => id.clone(),
        }
    }
}

impl RawChangeEvent {
    /// Decode the raw payload into the caller's entity type.
    pub fn decode<T: Entity>(self) -> SyncResult<ChangeEvent<T>> {
        let payload = match self.payload {
            ChangePayload::Entity(value) => ChangePayload::Entity(
                serde_json::from_value::<T>(value).map_err(SyncError::decode::<T>)?,
            ),
            ChangePayload::Id(id) => ChangePayload::Id(id),
        };
        Ok(ChangeEvent {
            kind: self.kind,
            owner_scope: self.owner_scope,
            payload,
            event_id: self.event_id,
        })
    }
}
