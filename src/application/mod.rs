//! Application layer - the resilience manager itself
//!
//! `AppContext` owns all state. The other modules extend it:
//! - STUN resolution sessions and the global STUN coordinator
//! - The listener restart sequencer
//! - The account IP-change coordinator
//! - The network-change watcher

pub mod context;
pub mod ip_change;
pub mod listener_restart;
pub mod nat_manager;
pub mod network_watch;
pub mod stun_session;

pub use context::{AppContext, AppContextBuilder};
pub use nat_manager::GLOBAL_STUN_TOKEN;
pub use network_watch::NetworkChange;
pub use stun_session::{SessionId, STUN_WAIT_BACKOFF};
