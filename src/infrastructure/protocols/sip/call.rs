//! Call-control interface used after an IP change

use crate::domain::shared::{CallId, Result};
use async_trait::async_trait;
use std::net::SocketAddr;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Terminate an active call
    async fn hangup(&self, call: CallId) -> Result<()>;

    /// Renegotiate an active call with a new contact; returns the final
    /// SIP status code of the re-INVITE
    async fn reinvite(&self, call: CallId, contact: SocketAddr) -> Result<u16>;
}
