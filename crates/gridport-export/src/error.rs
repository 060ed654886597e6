//! Error types for the export engine
//!
//! Two levels, kept deliberately separate: [`ExportError`] is the runtime's
//! error (configuration, store, bus, lifecycle), while [`HandlerError`] is
//! what transport handlers produce internally. Handlers never let a
//! `HandlerError` cross their `send` boundary — failures are folded into a
//! failed `ExportResult` instead.

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ExportError>;

/// Result type alias for handler-internal operations
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Runtime-level error for the export engine
#[derive(Error, Debug)]
pub enum ExportError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration store error
    #[error("Store error: {0}")]
    Store(String),

    /// Pub/sub bus connection or subscription error
    #[error("Bus error: {0}")]
    Bus(String),

    /// Event subscriber error
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// Scheduled exporter error
    #[error("Scheduler '{schedule_id}' error: {message}")]
    Scheduler { schedule_id: i64, message: String },

    /// Payload template could not be rendered
    #[error("Transform error for target '{target}': {message}")]
    Transform { target: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Handler error (from transport handler construction/checks)
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl ExportError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a bus error
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// Create a subscriber error
    pub fn subscriber(msg: impl Into<String>) -> Self {
        Self::Subscriber(msg.into())
    }

    /// Create a scheduler error for one schedule record
    pub fn scheduler(schedule_id: i64, msg: impl Into<String>) -> Self {
        Self::Scheduler {
            schedule_id,
            message: msg.into(),
        }
    }

    /// Create a transform error scoped to one target
    pub fn transform(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transform {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Check if this is a shutdown error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Check if the operation that produced this error can be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bus(_) | Self::Store(_) => true,
            Self::Handler(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ExportError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors produced inside transport handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler configuration invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to the downstream system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication rejected by the downstream system
    #[error("authentication error: {0}")]
    Auth(String),

    /// Timed out waiting for the downstream system
    #[error("timeout: {0}")]
    Timeout(String),

    /// Rate limited by the downstream system
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Payload serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient failure, may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Failure that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Transient(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}
