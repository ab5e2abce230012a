//! In-memory ordered list patched by change events.

use std::fmt;
use std::sync::Arc;

use syncline_core::{ChangeEvent, ChangeKind, ChangePayload, Entity, EntityId};

type Counter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New row prepended.
    Inserted,
    /// Row replaced in place.
    Replaced,
    /// Row removed.
    Removed,
    /// Nothing matched.
    Ignored,
}

/// Ordered rows plus a derived count of rows matching a predicate
/// (for example unread notifications).
pub struct LiveList<T> {
    items: Vec<T>,
    counted: usize,
    counter: Counter<T>,
}

impl<T: Entity> LiveList<T> {
    pub fn new<F>(counter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            items: Vec::new(),
            counted: 0,
            counter: Arc::new(counter),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Number of rows matching the counter predicate.
    pub fn counted(&self) -> usize {
        self.counted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.entity_id() == *id)
    }

    /// Apply a change event.
    ///
    /// Inserts prepend, except that an insert for an id already present
    /// replaces that row in place. Updates for unknown ids are ignored.
    pub fn apply(&mut self, event: ChangeEvent<T>) -> Applied {
        let id = event.entity_id();
        let applied = match (event.kind, event.payload) {
            (ChangeKind::Insert, ChangePayload::Entity(entity)) => match self.position(&id) {
                Some(index) => {
                    self.items[index] = entity;
                    Applied::Replaced
                }
                None => {
                    self.items.insert(0, entity);
                    Applied::Inserted
                }
            },
            (ChangeKind::Update, ChangePayload::Entity(entity)) => match self.position(&id) {
                Some(index) => {
                    self.items[index] = entity;
                    Applied::Replaced
                }
                None => Applied::Ignored,
            },
            (ChangeKind::Delete, _) => {
                let before = self.items.len();
                self.items.retain(|item| item.entity_id() != id);
                if self.items.len() < before {
                    Applied::Removed
                } else {
                    Applied::Ignored
                }
            }
            (_, ChangePayload::Id(_)) => Applied::Ignored,
        };
        if applied != Applied::Ignored {
            self.recount();
        }
        applied
    }

    pub fn replace_all(&mut self, items: Vec<T>) {
        self.items = items;
        self.recount();
    }

    /// Mutate every row in place.
    pub fn update_each(&mut self, mut f: impl FnMut(&mut T)) {
        self.items.iter_mut().for_each(&mut f);
        self.recount();
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
        self.recount();
    }

    fn recount(&mut self) {
        self.counted = self.items.iter().filter(|item| (self.counter)(*item)).count();
    }
}

impl<T: Clone> Clone for LiveList<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            counted: self.counted,
            counter: Arc::clone(&self.counter),
        }
    }
}

impl<T: PartialEq> PartialEq for LiveList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items && self.counted == other.counted
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveList")
            .field("items", &self.items)
            .field("counted", &self.counted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use syncline_core::OwnerScope;
    use uuid::Uuid;

    fn unread_list(rows: Vec<Value>) -> LiveList<Value> {
        let mut list = LiveList::new(|row: &Value| row["read"] == json!(false));
        list.replace_all(rows);
        list
    }

    fn scope() -> OwnerScope {
        OwnerScope::new(Uuid::nil())
    }

    #[test]
    fn test_insert_prepends_and_counts() {
        let mut list = unread_list(vec![json!({"id": "n1", "read": true})]);
        let applied = list.apply(ChangeEvent::insert(scope(), json!({"id": "n2", "read": false})));
        assert_eq!(applied, Applied::Inserted);
        assert_eq!(list.items()[0]["id"], "n2");
        assert_eq!(list.counted(), 1);
    }

    #[test]
    fn test_duplicate_insert_replaces_in_place() {
        let mut list = unread_list(vec![
            json!({"id": "n1", "read": false}),
            json!({"id": "n2", "read": false}),
        ]);
        let applied = list.apply(ChangeEvent::insert(scope(), json!({"id": "n2", "read": false})));
        assert_eq!(applied, Applied::Replaced);
        assert_eq!(list.len(), 2);
        assert_eq!(list.items()[1]["id"], "n2");
    }

    #[test]
    fn test_update_preserves_position() {
        let mut list = unread_list(vec![
            json!({"id": "n1", "read": false}),
            json!({"id": "n2", "read": false}),
            json!({"id": "n3", "read": false}),
        ]);
        list.apply(ChangeEvent::update(scope(), json!({"id": "n2", "read": true})));
        assert_eq!(list.items()[1], json!({"id": "n2", "read": true}));
        assert_eq!(list.counted(), 2);

        let unknown = list.apply(ChangeEvent::update(scope(), json!({"id": "n9", "read": true})));
        assert_eq!(unknown, Applied::Ignored);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_delete_removes_matching_id() {
        let mut list = unread_list(vec![
            json!({"id": "n1", "read": false}),
            json!({"id": "n2", "read": true}),
        ]);
        assert_eq!(list.apply(ChangeEvent::delete(scope(), "n1")), Applied::Removed);
        assert_eq!(list.apply(ChangeEvent::delete(scope(), "n1")), Applied::Ignored);
        assert_eq!(list.len(), 1);
        assert_eq!(list.counted(), 0);
    }
}
