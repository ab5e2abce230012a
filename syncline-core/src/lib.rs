//! Syncline Core - shared data types
//!
//! Pure data structures used by every other syncline crate: the error
//! taxonomy, query descriptors and their canonical cache keys, the entity
//! marker trait, and the change events delivered by push channels.

mod descriptor;
mod entity;
mod error;
mod event;
mod identity;

pub use descriptor::{CacheKey, FilterValue, OrderBy, QueryDescriptor, Scalar};
pub use entity::{Entity, EntityId, OwnerScope};
pub use error::{CacheError, ChannelError, FetchError, MutationError, SyncError, SyncResult};
pub use event::{ChangeEvent, ChangeKind, ChangePayload, RawChangeEvent};
pub use identity::{compute_content_hash, ContentHash, Timestamp};
