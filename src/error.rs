//! Unified error type hierarchy for SpeedtestNextGen
//!
//! Provides structured error handling with ConfigError, StoreError, EngineError
//! and the top-level TestError returned by the orchestration service.

use std::io;
use thiserror::Error;

/// Settings document parsing, validation and persistence errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid JSON in settings: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during settings operations: {0}")]
    IoError(#[from] io::Error),
}

/// Result store (history log) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error during history operations: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to replace history file: {0}")]
    Persist(String),
}

/// Failures raised by a measurement engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Canceled by user")]
    Cancelled,

    #[error("Ookla CLI timed out after {0} s")]
    Timeout(u64),

    #[error("speedtest executable not found at: {0}")]
    BinaryNotFound(String),

    #[error("Failed to launch '{cmd}': {reason}")]
    Spawn { cmd: String, reason: String },

    #[error("Ookla CLI failed: {0}")]
    ProcessFailed(String),

    #[error("Failed to parse engine output: {0}")]
    Parse(String),

    #[error("Request rejected (403 Forbidden): {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No matched servers: {0}")]
    NoMatchedServers(String),
}

impl EngineError {
    /// True when the error is the voluntary-stop condition rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// True when the remote side rejected our client identity.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, EngineError::Forbidden(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::FORBIDDEN) {
            EngineError::Forbidden(e.to_string())
        } else if e.is_decode() {
            EngineError::Parse(e.to_string())
        } else {
            EngineError::Network(e.to_string())
        }
    }
}

/// Top-level error for a test run.
#[derive(Error, Debug)]
pub enum TestError {
    #[error("Canceled by user")]
    Cancelled,

    #[error(transparent)]
    Engine(EngineError),

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl TestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TestError::Cancelled)
    }

    /// Get a user-facing error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            TestError::Cancelled => "Test canceled".to_string(),
            TestError::Engine(EngineError::Timeout(secs)) => {
                format!("The speed test took longer than {} seconds and was stopped", secs)
            }
            TestError::Engine(EngineError::BinaryNotFound(path)) => {
                format!("Ookla speedtest executable not found: {}", path)
            }
            TestError::Engine(e) => e.to_string(),
            TestError::Worker(msg) => format!("Background worker failed: {}", msg),
        }
    }
}

impl From<EngineError> for TestError {
    fn from(e: EngineError) -> Self {
        if e.is_cancelled() {
            TestError::Cancelled
        } else {
            TestError::Engine(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Timeout(90);
        assert_eq!(err.to_string(), "Ookla CLI timed out after 90 s");
    }

    #[test]
    fn test_cancellation_survives_conversion() {
        let err: TestError = EngineError::Cancelled.into();
        assert!(err.is_cancelled());

        let err: TestError = EngineError::ProcessFailed("boom".into()).into();
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Ookla CLI failed: boom");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValidationFailed("units must be Mbps or MB/s".to_string());
        assert_eq!(
            err.to_string(),
            "Settings validation failed: units must be Mbps or MB/s"
        );
    }

    #[test]
    fn test_user_message_for_timeout() {
        let err = TestError::Engine(EngineError::Timeout(5));
        assert!(err.user_message().contains("5 seconds"));
    }
}
