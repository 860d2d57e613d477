//! Error types for cachestore
//!
//! One error enum is shared by every crate in the workspace. Variants fall
//! into three groups:
//! - expected outcomes (`NotFound`, `ConcurrentConflict`)
//! - programming errors that must never be retried
//!   (`NotFetchedInTransaction`, `AlreadyPut`, `InvalidState`, `NotPreloaded`,
//!   `InternalConsistency`, `InvalidArgument`)
//! - collaborator failures (`Storage`, `Cache`, `Serialization`, `Config`)

use crate::types::Key;
use thiserror::Error;

/// Result type alias for cachestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cachestore
#[derive(Debug, Error)]
pub enum Error {
    /// Strict lookup of a key that has no record
    #[error("Entity not found: {0}")]
    NotFound(Key),

    /// The store rejected a commit because of a concurrent modification
    #[error("Concurrent modification conflict: {reason}")]
    ConcurrentConflict {
        /// Store-provided description of the conflict
        reason: String,
    },

    /// A persisted entity was modified inside an enforce-fetch transaction
    /// without being read in that transaction first
    #[error("Entity {0} was modified in a transaction without being fetched first")]
    NotFetchedInTransaction(Key),

    /// The same key was put twice in one unit of work while single-put
    /// tracking is enabled
    #[error("Entity {key} was already put in this request; first put at:\n{first_put}")]
    AlreadyPut {
        /// Key put twice
        key: Key,
        /// Backtrace captured at the first put
        first_put: String,
    },

    /// An operation was called in a state that forbids it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// EntityPool access to a key that was never loaded
    #[error("Entity {0} was not preloaded into the pool")]
    NotPreloaded(Key),

    /// Cache and store disagreed in a way that should be impossible
    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    /// Invalid argument (incomplete key, zero shard count, bad cursor)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded retry loop gave up
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryLimitExceeded {
        /// Number of attempts made
        attempts: usize,
        /// Error from the final attempt
        last: Box<Error>,
    },

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Distributed cache failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a conflict error
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::ConcurrentConflict {
            reason: reason.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// True for store-detected conflicts, the only retryable error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrentConflict { .. })
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for errors that indicate a bug in the calling code
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::NotFetchedInTransaction(_)
                | Error::AlreadyPut { .. }
                | Error::InvalidState(_)
                | Error::NotPreloaded(_)
                | Error::InternalConsistency(_)
                | Error::InvalidArgument(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
