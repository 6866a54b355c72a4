//! Error taxonomy for the collection runtime.
//!
//! Every failure that crosses a module boundary is a [`RuntimeError`], so
//! callers can tell "fix your credentials" from "this resource doesn't
//! exist" from "try again later" without string matching. The collector
//! consults [`RuntimeError::is_retryable`] to decide whether a failed page
//! fetch goes back into the retry loop.

use reqwest::StatusCode;
use thiserror::Error;

/// Unified error type for scheduling, collection, persistence, and
/// migrations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Bad or expired credentials (HTTP 401/403). Never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote resource does not exist (HTTP 404). Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, throttling, or a 5xx response. Retried with
    /// bounded backoff before becoming fatal to the owning subtask.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Caller or configuration error. Surfaced immediately, no retry.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The subtask dependency graph contains a cycle. Raised at plugin
    /// registration, before any task runs.
    #[error("dependency cycle among subtasks: {}", subtasks.join(" -> "))]
    CycleDetected { subtasks: Vec<String> },

    /// A migration script failed; startup must halt.
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u64,
        name: String,
        #[source]
        source: Box<RuntimeError>,
    },

    /// A subtask failed; carries the subtask name for task status
    /// reporting.
    #[error("subtask {subtask} failed: {source}")]
    Subtask {
        subtask: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unexpected condition. Fatal, logged with full context.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    pub fn bad_input<S: Into<String>>(msg: S) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an error with the name of the subtask it brought down.
    pub fn in_subtask(self, subtask: &str) -> Self {
        Self::Subtask {
            subtask: subtask.to_string(),
            source: Box::new(self),
        }
    }

    /// Classify an HTTP response status.
    ///
    /// 401/403 are authorization failures, 404 is a missing resource,
    /// 408/429 and all 5xx are transient. Anything else that isn't a
    /// success is treated as a caller error (malformed request, bad
    /// query), which no amount of retrying will fix.
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Unauthorized(format!("{status} from {url}, check your access token"))
            }
            StatusCode::NOT_FOUND => Self::NotFound(format!("{status} from {url}")),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Self::Transient(format!("{status} from {url}"))
            }
            s if s.is_server_error() => Self::Transient(format!("{status} from {url}")),
            _ => Self::BadInput(format!("unexpected {status} from {url}")),
        }
    }

    /// Whether the collector should feed this error back into its
    /// bounded retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        // Connection resets and timeouts are worth retrying; request
        // construction errors are not.
        if err.is_builder() {
            Self::BadInput(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
