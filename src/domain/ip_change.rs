//! IP-change cycle vocabulary: per-account state, progress reports

use super::shared::{AccountId, CallId, CycleId, Status, TransportId};
use std::sync::Arc;
use std::time::Duration;

/// Where an account is in the current IP-change cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountIpChangeState {
    Null,
    ShutdownTransport,
    UpdateContact,
    HangupCalls,
    ReinviteCalls,
    Completed,
}

/// Operation tag of a progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpChangeOp {
    RestartListener,
    ShutdownTransport,
    UpdateContact,
    HangupCalls,
    ReinviteCalls,
    Completed,
}

impl IpChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpChangeOp::RestartListener => "restart_listener",
            IpChangeOp::ShutdownTransport => "shutdown_transport",
            IpChangeOp::UpdateContact => "update_contact",
            IpChangeOp::HangupCalls => "hangup_calls",
            IpChangeOp::ReinviteCalls => "reinvite_calls",
            IpChangeOp::Completed => "completed",
        }
    }
}

/// Operation-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum IpChangeInfo {
    None,
    Transport { transport: TransportId },
    Account { account: AccountId, code: Option<u16> },
    Call { account: AccountId, call: CallId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpChangeProgress {
    pub cycle: CycleId,
    pub op: IpChangeOp,
    pub status: Status,
    pub info: IpChangeInfo,
}

/// Host application hook for progress reports
pub type IpChangeCallback = Arc<dyn Fn(&IpChangeProgress) + Send + Sync>;

/// Parameters of one IP-change cycle
#[derive(Debug, Clone)]
pub struct IpChangeParam {
    /// Restart listeners before touching accounts
    pub restart_listener: bool,
    /// Delay before retrying a failed restart; zero disables retry
    pub restart_retry_delay: Duration,
    /// Attempts per slot, including the first one
    pub restart_max_attempts: u32,
}

impl Default for IpChangeParam {
    fn default() -> Self {
        Self {
            restart_listener: true,
            restart_retry_delay: Duration::ZERO,
            restart_max_attempts: 3,
        }
    }
}
