//! Error types for the store client and the engine layers.

use crate::models::ViewId;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write carried a stale revision token.
    #[error("revision conflict on {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("store request failed: {0}")]
    Transport(String),

    #[error("unexpected store response: {0}")]
    Decode(String),
}

/// Errors loading view definitions from disk.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("view {0} is declared twice")]
    Duplicate(ViewId),

    #[error("view {view} has no map function")]
    MissingMap { view: ViewId },
}

/// Errors synchronizing one database.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A design document write lost the revision race twice.
    #[error("design document {database}/_design/{design} kept conflicting after retry")]
    Conflict { database: String, design: String },

    #[error("store error while synchronizing {database}: {source}")]
    Store {
        database: String,
        #[source]
        source: StoreError,
    },
}

/// Errors from the aggregation query layer.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The view was never verified or does not exist in the store.
    #[error("index {0} is not available; run sync and check the view definitions")]
    IndexUnavailable(ViewId),

    #[error("a keyword is required for this query")]
    EmptyKeyword,

    #[error("an area code is required for this query")]
    MissingArea,

    #[error(transparent)]
    Store(StoreError),
}

/// Errors loading reference data.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("no reference dataset named '{0}' is configured")]
    UnknownSeries(String),

    #[error("failed to load reference data '{name}': {source}")]
    Fetch {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Errors from the external correlation collaborator.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("correlation timed out after {0:?}")]
    Timeout(Duration),

    #[error("correlation process failed: {0}")]
    Failed(String),

    #[error("could not parse correlation output: {0:?}")]
    Parse(String),
}

impl CorrelationError {
    /// Only timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CorrelationError::Timeout(_))
    }
}

/// Errors building a composite report from several sources.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),
}
