//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The event loop and timer primitive
//! - STUN probing over UDP
//! - SIP listener, registration and call-control interfaces

pub mod event_loop;
pub mod protocols;
pub mod timer;
