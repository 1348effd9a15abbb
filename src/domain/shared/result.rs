//! Result types

use super::error::ReachError;

/// Standard result type for resilience operations
pub type Result<T> = std::result::Result<T, ReachError>;

/// Outcome reported through completion and progress callbacks
pub type Status = std::result::Result<(), ReachError>;
