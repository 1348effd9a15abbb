//! STUN resolution results and the process-wide cached state

use super::shared::{ReachError, Status, StunToken};
use std::net::SocketAddr;
use std::sync::Arc;

/// Result handed to the completion callback of a resolution session
#[derive(Debug, Clone, PartialEq)]
pub struct StunResolveResult {
    pub token: StunToken,
    pub status: Status,
    /// The server entry that answered, as supplied by the caller
    pub name: Option<String>,
    /// Mapped (public) address reported by the server
    pub addr: Option<SocketAddr>,
    /// Index of the answering entry in the caller's list
    pub index: Option<usize>,
}

impl StunResolveResult {
    pub fn failed(token: StunToken, err: ReachError) -> Self {
        Self {
            token,
            status: Err(err),
            name: None,
            addr: None,
            index: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }
}

/// Completion callback of a resolution session
pub type ResolveCallback = Arc<dyn Fn(&StunResolveResult) + Send + Sync>;

/// What `start` returns to its immediate caller
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveStatus {
    /// Work was enqueued; the callback reports the outcome later
    Pending,
    /// Blocking call finished with this status
    Done(Status),
}

/// NAT type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No NAT (direct internet connection)
    OpenInternet,
    /// Full cone NAT (port-preserving mapping)
    FullCone,
    /// Unknown/Error
    Unknown,
}

impl NatType {
    /// Classify from the local endpoint of a probe socket and the mapping
    /// the server observed for it.
    ///
    /// `local` must be the concrete address the probe was sent from. A
    /// single mapping cannot separate symmetric from port-restricted NATs,
    /// so a translated port yields `Unknown`.
    pub fn classify(local: SocketAddr, mapped: SocketAddr) -> Self {
        if local.ip().is_unspecified() {
            return NatType::Unknown;
        }
        if local.ip() == mapped.ip() {
            return NatType::OpenInternet;
        }
        if local.port() == mapped.port() {
            return NatType::FullCone;
        }
        NatType::Unknown
    }
}

/// NAT detection callback
pub type NatTypeCallback = Arc<dyn Fn(Result<NatType, ReachError>) + Send + Sync>;

/// Lifecycle of the global STUN resolution
#[derive(Debug, Clone, PartialEq)]
pub enum StunState {
    Unknown,
    Pending,
    Success,
    Error(ReachError),
}

impl StunState {
    pub fn is_pending(&self) -> bool {
        matches!(self, StunState::Pending)
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            StunState::Success => Some(Ok(())),
            StunState::Error(e) => Some(Err(e.clone())),
            _ => None,
        }
    }
}

/// Cached outcome of the global resolution
#[derive(Debug, Clone)]
pub struct GlobalStunState {
    pub state: StunState,
    pub mapped: Option<SocketAddr>,
    pub server: Option<String>,
    pub index: Option<usize>,
    pub nat_type: Option<NatType>,
    pub ignore_failure: bool,
    pub try_ipv6: bool,
}

impl GlobalStunState {
    pub fn new(ignore_failure: bool, try_ipv6: bool) -> Self {
        Self {
            state: StunState::Unknown,
            mapped: None,
            server: None,
            index: None,
            nat_type: None,
            ignore_failure,
            try_ipv6,
        }
    }

    /// Forget any cached outcome
    pub fn reset(&mut self) {
        self.state = StunState::Unknown;
        self.mapped = None;
        self.server = None;
        self.index = None;
        self.nat_type = None;
    }

    pub fn apply(&mut self, result: &StunResolveResult) {
        match &result.status {
            Ok(()) => {
                self.state = StunState::Success;
                self.mapped = result.addr;
                self.server = result.name.clone();
                self.index = result.index;
            }
            Err(e) => {
                self.state = StunState::Error(e.clone());
                self.mapped = None;
                self.server = None;
                self.index = None;
            }
        }
    }
}
