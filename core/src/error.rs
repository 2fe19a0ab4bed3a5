//! Structured error types for llm-lab
//!
//! Splits failures into configuration errors, which are detected before any
//! session starts, and runtime errors surfaced by the experiment platform or an
//! LLM provider while sessions run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for llm-lab operations
#[derive(Error, Debug)]
pub enum LabError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A roster slot has no model assigned
    #[error("player {player_id} has no assignment (expected 'human' or a model name)")]
    UnassignedSlot { player_id: u32 },

    /// Provider name outside the supported set
    #[error("unsupported provider: {name}")]
    UnsupportedProvider { name: String },

    /// Model name not present in the model registry
    #[error("player {player_id} is assigned model '{model}' which is not available")]
    UnknownModel { player_id: u32, model: String },

    /// Same player id listed twice
    #[error("player {player_id} is listed more than once")]
    DuplicateSlot { player_id: u32 },

    /// Player ids do not form 1..=n
    #[error("player ids must be contiguous from 1, missing player {player_id}")]
    MissingSlot { player_id: u32 },

    /// Roster has no rows
    #[error("roster is empty: {path}")]
    EmptyRoster { path: PathBuf },

    /// Roster file could not be interpreted
    #[error("invalid roster {path}: {reason}")]
    InvalidRoster { path: PathBuf, reason: String },

    /// Participant count incompatible with the paradigm's grouping
    #[error("{participants} participants cannot be split into groups of {group_size}")]
    InvalidGrouping { participants: usize, group_size: usize },

    /// App directory not found or incomplete
    #[error("app not found: {name}")]
    AppNotFound { name: String },

    /// Prompt book could not be parsed
    #[error("invalid prompt book {path}: {reason}")]
    InvalidPrompts { path: PathBuf, reason: String },

    /// Invalid settings value
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Missing required config
    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    // =========================================================================
    // Platform Errors
    // =========================================================================
    /// The experiment platform answered with an error status
    #[error("platform error: {status} - {message}")]
    Platform { status: u16, message: String },

    /// The platform could not be reached
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Page content could not be interpreted
    #[error("unexpected page at {url}: {reason}")]
    UnexpectedPage { url: String, reason: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// Provider rejected the credentials
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Rate limit exceeded (429)
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider returned an error
    #[error("provider error: {status} - {message}")]
    Provider { status: u16, message: String },

    /// LLM reply could not be turned into answers
    #[error("invalid LLM response: {reason}")]
    InvalidResponse { reason: String },

    // =========================================================================
    // Session / Bot Errors
    // =========================================================================
    /// Bot gave up on a participant
    #[error("bot for participant {participant} failed: {reason}")]
    BotFailed { participant: String, reason: String },

    /// Timeout
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// An HTTP request hit the client timeout
    #[error("request timed out: {message}")]
    RequestTimeout { message: String },

    /// The run was cancelled before this session started
    #[error("cancelled before the session started")]
    Cancelled,

    /// Helper process (platform or local LLM server) failed
    #[error("process '{program}' failed: {reason}")]
    Process { program: String, reason: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl LabError {
    /// True for errors detected while validating an experiment, before any
    /// session is created.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnassignedSlot { .. }
                | Self::UnsupportedProvider { .. }
                | Self::UnknownModel { .. }
                | Self::DuplicateSlot { .. }
                | Self::MissingSlot { .. }
                | Self::EmptyRoster { .. }
                | Self::InvalidRoster { .. }
                | Self::InvalidGrouping { .. }
                | Self::AppNotFound { .. }
                | Self::InvalidPrompts { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
        )
    }

    /// Check if error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } | Self::RequestTimeout { .. } => true,
            Self::RateLimited { .. } => true,
            Self::Provider { status, .. } | Self::Platform { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Delay the server asked for before the next attempt, if any
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LabError {
    /// Request URLs are stripped; some carry credentials in the query.
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Self::RequestTimeout {
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_request() {
            Self::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Result type alias using LabError
pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_retryable() {
        let err = LabError::UnassignedSlot { player_id: 2 };
        assert!(err.is_config_error());
        assert!(!err.is_retryable());

        let err = LabError::UnsupportedProvider {
            name: "mistral".to_string(),
        };
        assert!(err.is_config_error());
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_runtime_errors() {
        assert!(LabError::Provider {
            status: 503,
            message: "overloaded".to_string()
        }
        .is_retryable());

        assert!(!LabError::Provider {
            status: 400,
            message: "bad request".to_string()
        }
        .is_retryable());

        let err = LabError::Platform {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_retry_delay() {
        let err = LabError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(12)));
        assert_eq!(LabError::RateLimited { retry_after: None }.retry_delay(), None);
        assert_eq!(LabError::UnassignedSlot { player_id: 1 }.retry_delay(), None);
    }

    #[tokio::test]
    async fn test_transport_errors_drop_url() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/models?key=SECRETKEY123")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap_err();
        let err = LabError::from(err);
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("SECRETKEY123"), "{}", err);
    }

    #[test]
    fn test_request_timeout_message() {
        let err = LabError::RequestTimeout {
            message: "operation timed out".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("0ns"));
    }
}
