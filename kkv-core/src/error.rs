//! Error types for KKV client operations

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or KKV_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all KKV client errors.
#[derive(Debug, Clone, Error)]
pub enum KkvError {
    /// The write never got a 200 back within its attempt budget.
    #[error("Write to topic {topic} failed after {attempts} attempts")]
    RetryExhausted { topic: String, attempts: u32 },

    /// A completed stream line was not valid JSON.
    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },

    #[error("Transport error during {operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    #[error("Unexpected status {status} from {operation}")]
    UnexpectedStatus { operation: &'static str, status: u16 },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("Codec error: {reason}")]
    Codec { reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {reason}")]
    Metrics { reason: String },

    #[error("Telemetry error: {reason}")]
    Telemetry { reason: String },
}

impl KkvError {
    pub fn transport(operation: &'static str, reason: impl ToString) -> Self {
        Self::Transport {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_response(operation: &'static str, reason: impl ToString) -> Self {
        Self::InvalidResponse {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for KKV operations.
pub type KkvResult<T> = Result<T, KkvError>;

// =============================================================================
// TESTS
// =============================================================================
