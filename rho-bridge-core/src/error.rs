//! Error taxonomy for the bridge.
//!
//! Every fallible bridge operation resolves to one of these variants so that
//! callers (C13 Worker Runtime in particular) can apply the propagation
//! policy from the error handling design uniformly: transient errors are
//! retried or counted, permanent/parse errors are logged and dropped, and
//! lease/config errors are fatal.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type returned by bridge components.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// HTTP 429/5xx or network failure. Caller should retry per [`crate::retry`].
    #[error("transient API error: {0}")]
    TransientApi(String),

    /// HTTP 4xx (non-429) or another non-retryable API rejection.
    #[error("permanent API error: {0}")]
    PermanentApi(String),

    /// Malformed update, invalid check-trigger payload, or corrupt queue file.
    #[error("malformed data: {0}")]
    ParseShape(String),

    /// Subprocess crashed, stdin closed, or a protocol-level JSONL violation.
    #[error("rpc protocol error: {0}")]
    RpcProtocol(String),

    /// A prompt did not resolve before its deadline.
    #[error("rpc timeout after {0:?}")]
    RpcTimeout(std::time::Duration),

    /// Caller is not permitted to use the bridge.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// This process no longer holds the worker lease.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Missing token, disabled worker, or another configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to read or write a file at `path`.
    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON content.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error belongs to the transient-api class and should be
    /// retried rather than surfaced to the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::TransientApi(_))
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
