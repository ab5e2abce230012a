//! Error types for syncline operations
//!
//! The taxonomy follows the three failure paths of the synchronization
//! layer: fetch errors are per-query and never invalidate cached data,
//! mutation errors are surfaced after rollback, channel errors belong to the
//! push transport. Storage and decode failures round it out.

use thiserror::Error;

/// Remote query failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Query on {resource} failed: {reason}")]
    QueryFailed { resource: String, reason: String },

    #[error("Query on {resource} rejected with status {status}: {message}")]
    Rejected {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Remote write failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Write to {resource} failed: {reason}")]
    WriteFailed { resource: String, reason: String },

    #[error("Write to {resource} rejected with status {status}: {message}")]
    Rejected {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("Write to {resource} matched no rows")]
    NoRowsAffected { resource: String },
}

/// Push channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to open channel for scope {scope}: {reason}")]
    ConnectFailed { scope: String, reason: String },

    #[error("Channel for scope {scope} closed")]
    Closed { scope: String },

    #[error("Undecodable channel frame: {reason}")]
    Decode { reason: String },

    #[error("No owner scope connected")]
    NotConnected,
}

/// Cache storage medium failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Master error type for all syncline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Failed to decode {type_name}: {reason}")]
    Decode { type_name: &'static str, reason: String },

    #[error("Query slot {key} already holds a different entity type (expected {expected})")]
    TypeMismatch { key: String, expected: &'static str },
}

impl SyncError {
    /// Build a decode error for the target type `T`.
    pub fn decode<T>(reason: impl ToString) -> Self {
        Self::Decode {
            type_name: std::any::type_name::<T>(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error came from a remote query.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// Returns true if this error came from a remote write.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Mutation(_))
    }
}

/// Result type alias for syncline operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::Rejected {
            resource: "orders".to_string(),
            status: 503,
            message: "unavailable".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("orders"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_sync_error_from_sub_errors() {
        let err: SyncError = MutationError::NoRowsAffected {
            resource: "orders".to_string(),
        }
        .into();
        assert!(err.is_mutation());
        assert!(!err.is_fetch());

        let err: SyncError = CacheError::LockPoisoned.into();
        assert!(matches!(err, SyncError::Cache(CacheError::LockPoisoned)));
    }

    #[test]
    fn test_decode_error_names_type() {
        let err = SyncError::decode::<u32>("expected a number");
        match err {
            SyncError::Decode { type_name, reason } => {
                assert_eq!(type_name, "u32");
                assert_eq!(reason, "expected a number");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
