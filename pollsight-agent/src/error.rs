//! Error types for the agent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while loading configuration or assembling the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Malformed JSON5 or wrong field types.
    #[error(transparent)]
    ConfigParse(#[from] pollsight_common::Error),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// HTTP client construction error.
    #[error("Failed to build upstream client: {0}")]
    Client(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }
}

/// Failure of one endpoint during a poll cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Query '{query}' failed: {message}")]
    Query { query: String, message: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PollError {
    /// Create a query error.
    pub fn query(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            query: query.into(),
            message: message.into(),
        }
    }

    /// Classify this error for health reporting.
    pub fn error_type(&self) -> ErrorType {
        match self {
            PollError::Timeout(_) => ErrorType::Timeout,
            PollError::Auth(_) => ErrorType::AuthFailed,
            PollError::ConnectionRefused(_) => ErrorType::ConnectionRefused,
            PollError::Connection(_) => ErrorType::Connection,
            PollError::Query { .. } => ErrorType::QueryFailed,
            PollError::Protocol(_) => ErrorType::ProtocolError,
            PollError::Config(_) => ErrorType::ConfigError,
        }
    }

    /// Whether the endpoint itself could not be reached. Such failures void
    /// the whole endpoint for the cycle; anything else only skips one query.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            PollError::Timeout(_)
                | PollError::Auth(_)
                | PollError::ConnectionRefused(_)
                | PollError::Connection(_)
        )
    }

    /// Map an I/O error from a connect attempt on `target` onto the poll
    /// taxonomy.
    pub fn from_io(target: &str, err: &std::io::Error) -> Self {
        let message = format!("{}: {}", target, err);
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(message),
            std::io::ErrorKind::TimedOut => Self::Timeout(0),
            std::io::ErrorKind::PermissionDenied => Self::Auth(message),
            _ => Self::Connection(message),
        }
    }
}

/// Error type classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Endpoint did not answer in time.
    Timeout,
    /// Credentials rejected.
    AuthFailed,
    /// Connection refused.
    ConnectionRefused,
    /// Any other connection failure.
    Connection,
    /// The query itself failed.
    QueryFailed,
    /// Unexpected response from the endpoint.
    ProtocolError,
    /// Endpoint or query misconfigured.
    ConfigError,
    /// Other/unknown error.
    #[default]
    Other,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorType::Timeout => "timeout",
            ErrorType::AuthFailed => "auth_failed",
            ErrorType::ConnectionRefused => "connection_refused",
            ErrorType::Connection => "connection",
            ErrorType::QueryFailed => "query_failed",
            ErrorType::ProtocolError => "protocol_error",
            ErrorType::ConfigError => "config_error",
            ErrorType::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// A single field could not be turned into a metric value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("field '{0}' is missing from the result")]
    Missing(String),
    #[error("field '{0}' is null")]
    Null(String),
    #[error("field '{field}' is not numeric: {value:?}")]
    NotNumeric { field: String, value: String },
    #[error("field '{0}' is not a finite number")]
    NotFinite(String),
}

/// Upstream submission failure.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to encode report: {0}")]
    Encode(String),
    #[error("Failed to reach upstream: {0}")]
    Transport(String),
    #[error("Upstream rejected report with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<pollsight_common::Error> for ReportError {
    fn from(err: pollsight_common::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<reqwest::Error> for ReportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
