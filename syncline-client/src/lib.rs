//! Syncline Client - query, mutation and realtime executors
//!
//! The synchronization layer between a UI and a remote structured-data
//! service:
//!
//! - [`QueryClient`] serves cached query results immediately and refreshes
//!   them in the background once they are stale.
//! - [`Mutation`] applies optimistic patches to cached results, writes to
//!   the remote, and rolls back on failure before invalidating affected keys.
//! - [`RealtimeSubscriber`] keeps an in-memory list in step with a push
//!   channel of change events.
//!
//! The remote service is reached through the [`RemoteQuery`],
//! [`RemoteWrite`] and [`RemoteChannel`] traits; [`RestAccessor`] and
//! [`WsChangeChannel`] are the production implementations.

pub mod alerts;
pub mod config;
pub mod error;
pub mod live_list;
pub mod mutation;
pub mod notifications;
pub mod orders;
pub mod query;
pub mod realtime;
pub mod remote;
pub mod rest;
pub mod session;
pub mod telemetry;
pub mod ws;

pub use alerts::{Alert, AlertLevel, AlertSink};
pub use config::{ConfigError, SyncConfig};
pub use error::ClientError;
pub use live_list::{Applied, LiveList};
pub use mutation::{Mutation, MutationBuilder};
pub use notifications::{Notification, NotificationCenter, Notifications};
pub use query::{QueryClient, QueryHandle, QueryOptions, QueryState, DEFAULT_STALE_TIME};
pub use realtime::{ConnectionState, RealtimeSubscriber, SubscriptionHandle};
pub use remote::{RemoteChannel, RemoteQuery, RemoteWrite, Subscription, WriteOperation, WriteRequest};
pub use rest::{RestAccessor, RestClientError};
pub use session::SyncSession;
pub use ws::WsChangeChannel;
