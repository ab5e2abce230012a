//! Session wiring: one cache, one remote accessor, one change channel.

use std::sync::Arc;

use syncline_storage::{CacheStore, InMemoryInvalidationJournal, LmdbCacheBackend};
use tokio::sync::mpsc;
use tracing::info;

use crate::alerts::{Alert, AlertSink};
use crate::config::SyncConfig;
use crate::error::ClientError;
use crate::notifications::NotificationCenter;
use crate::query::QueryClient;
use crate::rest::RestAccessor;
use crate::ws::WsChangeChannel;

/// Everything a signed-in application session needs to read, write and
/// follow remote data.
pub struct SyncSession {
    config: SyncConfig,
    queries: QueryClient,
    rest: Arc<RestAccessor>,
    notifications: NotificationCenter,
}

impl SyncSession {
    /// Open the session described by `config`.
    ///
    /// Returns the session and the receiving end of its alert queue.
    pub fn open(config: SyncConfig) -> Result<(Self, mpsc::Receiver<Alert>), ClientError> {
        config.validate()?;

        let backend = LmdbCacheBackend::new(&config.cache.path, config.cache.max_size_mb)?;
        let cache = CacheStore::new(
            Arc::new(backend),
            Arc::new(InMemoryInvalidationJournal::new()),
            config.cache_config(),
        );
        let rest = Arc::new(RestAccessor::new(&config)?);
        let channel = Arc::new(WsChangeChannel::new(&config)?);
        let queries = QueryClient::with_stale_time(cache, rest.clone(), config.stale_time());

        let (sink, alerts) = AlertSink::channel(config.realtime.alert_buffer);
        let notifications = NotificationCenter::with_alerts(
            rest.clone(),
            rest.clone(),
            channel,
            config.realtime.dedup_window,
            sink,
        );

        info!(
            api = %config.api_base_url,
            cache = %config.cache.path.display(),
            "sync session opened"
        );
        Ok((
            Self {
                config,
                queries,
                rest,
                notifications,
            },
            alerts,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    /// Remote accessor for building mutations.
    pub fn rest(&self) -> Arc<RestAccessor> {
        Arc::clone(&self.rest)
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }
}
