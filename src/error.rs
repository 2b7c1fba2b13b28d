use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A path names an entity type the schema does not declare.
    #[error("unknown entity type: {0}")]
    UnknownType(String),

    /// No declared child path pattern matches the requested path.
    /// Signals a programming or configuration error, never retried.
    #[error("no child path ({path}) found for root ({root})")]
    SchemaMismatch { root: String, path: String },

    /// The schema itself is inconsistent (dangling pattern target,
    /// binder field not declared on its entity type).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A command round-trip was rejected by the server.
    #[error("command failed with code {code}: {detail}")]
    CommandRejected { code: i64, detail: String },

    /// The duplex channel failed or went away mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// A command round-trip outlived its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// REST fetch-through failed; no freshness row is recorded so the
    /// next request retries.
    #[error("fetch failed: {0}")]
    Fetch(#[from] ApiError),

    /// Persistent store I/O failure.
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parent path resolution recursed past the schema's nesting depth.
    #[error("indirect resolution too deep for path: {0}")]
    ResolutionDepth(String),

    /// Indirect resolution found no parent record to take a canonical
    /// id from.
    #[error("no parent record found for path: {0}")]
    ParentNotFound(String),
}
