//! Error types of the import engine
//!
//! Three layers, each with its own enum:
//! - [`DecodeError`]: a single line could not be used; the driver counts it
//!   and moves on
//! - [`WriteError`]: a sink write failed; the persister switches to plain
//!   inserts on a missing constraint, a lost connection is retried like any
//!   other transport failure, anything else is fatal
//! - [`ImportError`]: a slice failed; the scheduler retries recoverable
//!   errors from the last checkpoint and fails the job on the rest

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::RecordKind;

/// A classified line that produced nothing usable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed {kind} line: {reason}")]
    Malformed { kind: RecordKind, reason: String },

    #[error("{kind} line before any header declared a fiscal period")]
    MissingPeriod { kind: RecordKind },
}

/// Failure of a single batch write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The destination has no uniqueness constraint to upsert against
    #[error("no uniqueness constraint on {0}")]
    MissingConstraint(String),

    /// The connection to the destination was lost mid-write
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Failed(String),
}

impl WriteError {
    /// Classify a driver error, prefixing it with what was being written
    pub fn from_sqlx(context: impl std::fmt::Display, err: sqlx::Error) -> Self {
        let message = format!("{}: {}", context, err);
        if is_transport(&err) {
            WriteError::Transport(message)
        } else {
            WriteError::Failed(message)
        }
    }
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        if is_transport(&err) {
            WriteError::Transport(err.to_string())
        } else {
            WriteError::Failed(err.to_string())
        }
    }
}

fn is_transport(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Slice-level failure
#[derive(Error, Debug)]
pub enum ImportError {
    /// Connection resets, premature end of stream, pool exhaustion
    #[error("transport error: {0}")]
    Transport(String),

    /// A batch could not be written for a reason other than a key conflict
    #[error("destination write failed: {0}")]
    Destination(String),

    #[error("database error: {0}")]
    Database(String),

    /// The source object is missing or unreadable
    #[error("source error: {0}")]
    Source(String),

    #[error("import job {0} not found")]
    JobNotFound(Uuid),

    #[error("invalid checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ImportError {
    /// Only transport failures are retried from the last checkpoint
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ImportError::Transport(_))
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        if is_transport(&err) {
            ImportError::Transport(err.to_string())
        } else {
            ImportError::Database(err.to_string())
        }
    }
}

impl From<WriteError> for ImportError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Transport(message) => ImportError::Transport(message),
            other => ImportError::Destination(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Transport(err.to_string())
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
