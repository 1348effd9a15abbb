//! sipreach - keeps a SIP user agent reachable across network changes
//!
//! Discovers the public address through an ordered list of STUN servers
//! and, when the local IP address changes, restarts listeners and brings
//! registrations and calls back over the new address.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AppContext, AppContextBuilder};
pub use domain::shared::error::ReachError;
pub use domain::shared::result::{Result, Status};
