//! Entity identity and owner scopes

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identity of a row held in a query result or a live list.
///
/// Remote rows use either integer or string primary keys; both are
/// normalized to their string form so that `42` and `"42"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Extract an id from a JSON value (string or number).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Extract the `id` field of a JSON row.
    pub fn of_row(row: &Value) -> Option<Self> {
        row.get("id").and_then(Self::from_json)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Marker trait for rows that can be cached, patched and synchronized.
///
/// # Implementation Requirements
///
/// - `entity_id()` must return the primary key of the row
/// - Implementations must be `Clone`, `Serialize`, and `DeserializeOwned` for cache storage
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get the unique identifier for this row.
    fn entity_id(&self) -> EntityId;
}

impl Entity for Value {
    fn entity_id(&self) -> EntityId {
        EntityId::of_row(self).unwrap_or_else(|| EntityId::new(""))
    }
}

/// Identity a realtime channel and its events are partitioned by,
/// typically the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerScope(Uuid);

impl OwnerScope {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OwnerScope {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_and_string_ids_compare_equal() {
        let numeric = EntityId::from_json(&json!(42)).expect("number id");
        let text = EntityId::from_json(&json!("42")).expect("string id");
        assert_eq!(numeric, text);
        assert_eq!(EntityId::from(42), numeric);
    }

    #[test]
    fn test_of_row_requires_id_field() {
        assert_eq!(
            EntityId::of_row(&json!({"id": "n1", "read": false})),
            Some(EntityId::from("n1"))
        );
        assert_eq!(EntityId::of_row(&json!({"read": false})), None);
        assert_eq!(EntityId::from_json(&json!({"nested": 1})), None);
    }

    #[test]
    fn test_owner_scope_serializes_as_bare_uuid() {
        let id = Uuid::nil();
        let scope = OwnerScope::new(id);
        let encoded = serde_json::to_string(&scope).expect("serialize");
        assert_eq!(encoded, format!("\"{}\"", id));
    }
}
