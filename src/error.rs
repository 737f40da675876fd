//! Error types for the relay agent SDK.
//!
//! The error surface mirrors the provider taxonomy the agent needs for its
//! retry policy: transient failures (`RateLimited`, `Timeout`, `Connection`,
//! `ServerError`, `Unknown`) are retried with exponential backoff, while
//! client-side failures (`BadRequest`, `Unauthorized`, `NotFound`,
//! `Validation`) fail fast. Everything else (tool failures, storage
//! problems, relay misuse) carries its own variant so callers can match on
//! what actually went wrong.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by the retry driver and the
/// run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Provider rate limit exceeded (HTTP 429)
    RateLimited,
    /// Request or stream timed out
    Timeout,
    /// Network-level connection failure
    Connection,
    /// Provider-side server error (5xx)
    ServerError,
    /// Malformed request (HTTP 400)
    BadRequest,
    /// Authentication or permission failure (401/403)
    Unauthorized,
    /// Unknown model or endpoint (404)
    NotFound,
    /// Request failed provider validation (422)
    Validation,
    /// Anything the provider surfaced that we could not classify
    Unknown,
    /// Tool execution failure
    Tool,
    /// Storage adapter failure
    Storage,
    /// Invalid configuration
    Config,
    /// Frontend-tool relay misuse (resume validation)
    Relay,
    /// Run was cancelled by the caller
    Interrupted,
    /// Step budget exhausted
    MaxSteps,
}

impl ErrorKind {
    /// Stable lowercase name, used in run-log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::ServerError => "server_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Tool => "tool",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Relay => "relay",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::MaxSteps => "max_steps",
        }
    }
}

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// Provider rate limit exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Request or stream timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Network connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Provider returned a 5xx
    #[error("server error: {0}")]
    ServerError(String),

    /// Provider rejected the request as malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Authentication or permission failure
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Model or endpoint not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider-side validation failure
    #[error("validation error: {0}")]
    Validation(String),

    /// Unclassified provider failure
    #[error("unknown provider error: {0}")]
    Unknown(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Storage adapter error
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Frontend-tool relay misuse: resuming when not awaiting, or with a
    /// result set that does not match the pending descriptors
    #[error("relay error: {0}")]
    Relay(String),

    /// The caller cancelled the run
    #[error("run interrupted")]
    Interrupted,

    /// The step budget was exhausted before the model finished
    #[error("max steps exceeded ({0})")]
    MaxSteps(u32),
}

impl Error {
    /// Create a new rate-limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Error::RateLimited(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a new server error
    pub fn server(msg: impl Into<String>) -> Self {
        Error::ServerError(msg.into())
    }

    /// Create a new unknown provider error
    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new relay error
    pub fn relay(msg: impl Into<String>) -> Self {
        Error::Relay(msg.into())
    }

    /// Classify an HTTP status code from the provider into an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            400 => Error::BadRequest(body),
            401 | 403 => Error::Unauthorized(body),
            404 => Error::NotFound(body),
            408 => Error::Timeout(body),
            422 => Error::Validation(body),
            429 => Error::RateLimited(body),
            500..=599 => Error::ServerError(body),
            _ => Error::Unknown(format!("HTTP {status}: {body}")),
        }
    }

    /// The coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Connection(_) => ErrorKind::Connection,
            Error::ServerError(_) => ErrorKind::ServerError,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Json(_) => ErrorKind::Unknown,
            Error::Tool(_) => ErrorKind::Tool,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Config(_) => ErrorKind::Config,
            Error::Relay(_) => ErrorKind::Relay,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::MaxSteps(_) => ErrorKind::MaxSteps,
        }
    }

    /// Whether the retry driver should retry the whole stream for this error.
    ///
    /// Transient provider failures are retryable; client errors, tool
    /// failures, and everything local fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::ServerError
                | ErrorKind::Unknown
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Connection(err.to_string())
        }
    }
}
