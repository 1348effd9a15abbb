//! Registration client interface
//!
//! REGISTER transactions, digest challenges and refresh timers live in the
//! SIP stack; the resilience manager only asks for a fresh registration
//! with a new contact and looks at the final status code.

use crate::domain::shared::{AccountId, Result};
use async_trait::async_trait;
use std::net::SocketAddr;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Send REGISTER advertising `contact`; returns the final SIP status
    /// code, or 0 when the request never got a response
    async fn register(&self, account: AccountId, contact: SocketAddr) -> Result<u16>;

    /// Send REGISTER with `Expires: 0`
    async fn unregister(&self, account: AccountId) -> Result<u16>;
}
