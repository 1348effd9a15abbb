//! Domain layer - state and vocabulary of the transport resilience manager
//!
//! This layer contains:
//! - Accounts and their IP-change policy
//! - Transport slots and restart state
//! - STUN resolution results and the cached global state
//! - IP-change progress reports

pub mod account;
pub mod ip_change;
pub mod shared;
pub mod stun;
pub mod transport;

// Re-export commonly used types
pub use shared::{ReachError, Result, Status};
