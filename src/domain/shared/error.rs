//! Errors reported by the resilience manager

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReachError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid server address: {0}")]
    Parse(String),

    #[error("Name resolution failed: {0}")]
    Resolve(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("STUN probe failed: {0}")]
    Probe(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Registration failed with SIP status {code}: {reason}")]
    Registration { code: u16, reason: String },

    #[error("Call control failed: {0}")]
    Call(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReachError {
    /// Whether this error belongs to a single STUN trial and should
    /// make the session move on to the next candidate.
    pub fn is_trial_error(&self) -> bool {
        matches!(
            self,
            ReachError::Parse(_)
                | ReachError::Resolve(_)
                | ReachError::Socket(_)
                | ReachError::Probe(_)
                | ReachError::Timeout
        )
    }
}

impl From<std::io::Error> for ReachError {
    fn from(err: std::io::Error) -> Self {
        ReachError::Socket(err.to_string())
    }
}

impl From<config::ConfigError> for ReachError {
    fn from(err: config::ConfigError) -> Self {
        ReachError::Config(err.to_string())
    }
}
