//! Error type for assembling a sync session.

use syncline_core::SyncError;
use syncline_storage::LmdbCacheError;

use crate::config::ConfigError;
use crate::rest::RestClientError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rest(#[from] RestClientError),
    #[error(transparent)]
    Storage(#[from] LmdbCacheError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
