/// Global STUN coordinator
///
/// Caches the outcome of one process-wide resolution over the configured
/// server list. Transport creation and NAT type detection read the cache;
/// concurrent callers attach to the single in-flight session instead of
/// starting their own.
use super::context::{AppContext, Core, WAIT_SLICE};
use super::stun_session::STUN_WAIT_BACKOFF;
use crate::domain::shared::{AddressFamily, ReachError, Result, Status, StunServer, StunToken};
use crate::domain::stun::{GlobalStunState, NatType, ResolveCallback, ResolveStatus, StunResolveResult, StunState};
use crate::infrastructure::event_loop::in_async_context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Token carried by the global resolution session
pub const GLOBAL_STUN_TOKEN: StunToken = StunToken(u64::MAX);

impl Core {
    /// Start the global resolution when needed and return the state the
    /// caller should act on
    pub(crate) fn start_global(self: &Arc<Self>, retry_on_error: bool) -> Result<StunState> {
        let mut inner = self.lock();
        match &inner.global_stun.state {
            StunState::Success | StunState::Pending => return Ok(inner.global_stun.state.clone()),
            StunState::Error(_) if !retry_on_error => return Ok(inner.global_stun.state.clone()),
            StunState::Error(_) | StunState::Unknown => {}
        }

        if inner.stun_servers.is_empty() {
            debug!("No STUN servers configured, publishing local addresses");
            inner.global_stun.reset();
            inner.global_stun.state = StunState::Success;
            self.stun_watch.send_replace(StunState::Success);
            return Ok(StunState::Success);
        }

        inner.global_generation += 1;
        let generation = inner.global_generation;
        let core = Arc::downgrade(self);
        let callback: ResolveCallback = Arc::new(move |result: &StunResolveResult| {
            if let Some(core) = core.upgrade() {
                core.on_global_result(generation, result);
            }
        });

        let servers = inner.stun_servers.clone();
        let id = self.start_session_locked(&mut inner, &servers, GLOBAL_STUN_TOKEN, callback, false)?;
        inner.global_session = Some(id);
        inner.global_stun.reset();
        inner.global_stun.state = StunState::Pending;
        self.stun_watch.send_replace(StunState::Pending);
        info!("Global STUN resolution started over {} server(s)", servers.len());
        Ok(StunState::Pending)
    }

    fn on_global_result(self: &Arc<Self>, generation: u64, result: &StunResolveResult) {
        let detect = {
            let mut inner = self.lock();
            if inner.global_generation != generation {
                debug!("Ignoring result of a superseded global STUN resolution");
                return;
            }
            inner.global_stun.apply(result);
            inner.global_session = None;
            self.stun_watch.send_replace(inner.global_stun.state.clone());
            result.is_success()
                && self.config.stun.detect_nat_type
                && inner.global_stun.nat_type.is_none()
                && inner.global_stun.server.is_some()
        };

        if let Some(callback) = &self.callbacks.on_stun_resolved {
            callback(result);
        }

        if detect {
            let core = self.clone();
            self.handle.spawn(async move {
                if let Err(e) = core.detect_nat_type().await {
                    warn!("NAT type detection failed: {}", e);
                }
            });
        }
    }

    /// Await the global resolution from async code
    pub(crate) async fn resolve_global_async(self: &Arc<Self>) -> StunState {
        let mut rx = self.stun_watch.subscribe();
        let state = match self.start_global(false) {
            Ok(state) => state,
            Err(e) => return StunState::Error(e),
        };
        if !state.is_pending() {
            return state;
        }

        loop {
            if rx.changed().await.is_err() {
                return self.lock().global_stun.state.clone();
            }
            let state = rx.borrow_and_update().clone();
            if !state.is_pending() {
                return state;
            }
        }
    }

    /// Address a new transport bound at `local` should publish
    pub(crate) async fn published_address(self: &Arc<Self>, local: SocketAddr) -> Result<SocketAddr> {
        let state = self.resolve_global_async().await;
        let inner = self.lock();
        match state {
            StunState::Success => Ok(inner
                .global_stun
                .mapped
                .map(|mapped| SocketAddr::new(mapped.ip(), local.port()))
                .unwrap_or(local)),
            StunState::Error(e) if inner.global_stun.ignore_failure => {
                warn!("STUN unavailable ({}), publishing local address {}", e, local);
                Ok(local)
            }
            StunState::Error(e) => Err(e),
            StunState::Unknown | StunState::Pending => Ok(local),
        }
    }

    /// Probe the resolved server again and classify the NAT in front of us
    pub(crate) async fn detect_nat_type(self: &Arc<Self>) -> Result<NatType> {
        let (entry, family) = {
            let inner = self.lock();
            match (&inner.global_stun.state, &inner.global_stun.server, inner.global_stun.mapped) {
                (StunState::Success, Some(server), Some(mapped)) => (server.clone(), AddressFamily::of(&mapped)),
                _ => {
                    return Err(ReachError::InvalidArgument(
                        "NAT type detection needs a resolved STUN server".to_string(),
                    ))
                }
            }
        };

        let server = StunServer::parse(&entry)?;
        let probe = tokio::time::timeout(self.config.stun.timeout(), self.prober.probe(&server, family)).await;
        let outcome = match probe {
            Ok(Ok(outcome)) => Ok(NatType::classify(outcome.local, outcome.mapped)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReachError::Timeout),
        };

        if let Ok(nat_type) = &outcome {
            info!("NAT type via {}: {:?}", entry, nat_type);
            self.lock().global_stun.nat_type = Some(*nat_type);
        }
        if let Some(callback) = &self.callbacks.on_nat_type {
            callback(outcome.clone());
        }
        outcome
    }
}

impl AppContext {
    /// Resolve the configured STUN servers once for the whole context.
    ///
    /// A cached success is returned as is. While a resolution runs, callers
    /// attach to it. A cached error is kept unless `retry_on_error`.
    pub fn resolve_stun(&self, wait: bool, retry_on_error: bool) -> Result<ResolveStatus> {
        if wait && in_async_context() {
            return Err(ReachError::InvalidArgument(
                "blocking STUN resolution requested from an async context".to_string(),
            ));
        }
        let state = self.core.start_global(retry_on_error)?;
        if let Some(status) = state.status() {
            return Ok(ResolveStatus::Done(status));
        }
        if !wait {
            return Ok(ResolveStatus::Pending);
        }
        Ok(ResolveStatus::Done(self.wait_global()))
    }

    /// Async variant of [`AppContext::resolve_stun`]
    pub async fn resolve_stun_async(&self) -> Status {
        match self.core.resolve_global_async().await {
            StunState::Success => Ok(()),
            StunState::Error(e) => Err(e),
            StunState::Unknown | StunState::Pending => Err(ReachError::Cancelled),
        }
    }

    /// Replace the server list and forget the cached outcome
    pub fn update_stun_servers(&self, servers: Vec<String>) {
        {
            let mut inner = self.core.lock();
            info!("STUN server list replaced ({} entries)", servers.len());
            inner.stun_servers = servers;
            inner.global_generation += 1;
            inner.global_session = None;
            inner.global_stun.reset();
            self.core.stun_watch.send_replace(StunState::Unknown);
        }
        if let Ok(n) = self.core.cancel_sessions(GLOBAL_STUN_TOKEN, false) {
            debug!("Cancelled {} superseded global STUN session(s)", n);
        }
    }

    /// Snapshot of the global STUN state
    pub fn stun_state(&self) -> GlobalStunState {
        self.core.lock().global_stun.clone()
    }

    pub fn nat_type(&self) -> Option<NatType> {
        self.core.lock().global_stun.nat_type
    }

    pub async fn detect_nat_type(&self) -> Result<NatType> {
        self.core.detect_nat_type().await
    }

    fn wait_global(&self) -> Status {
        let (servers, session) = {
            let inner = self.core.lock();
            (inner.stun_servers.len().max(1), inner.global_session)
        };
        let budget = self
            .core
            .config
            .stun
            .timeout()
            .saturating_mul(servers as u32)
            .saturating_mul(STUN_WAIT_BACKOFF);
        let deadline = Instant::now() + budget;

        loop {
            let state = self.core.lock().global_stun.state.clone();
            match state {
                StunState::Success => return Ok(()),
                StunState::Error(e) => return Err(e),
                StunState::Unknown => return Err(ReachError::Cancelled),
                StunState::Pending => {}
            }
            if Instant::now() >= deadline {
                if let Some(id) = session {
                    warn!("Global STUN resolution exceeded its deadline");
                    self.core.complete(id, Err(ReachError::Timeout), None, true);
                    continue;
                }
                return Err(ReachError::Timeout);
            }
            self.drive(WAIT_SLICE);
        }
    }
}
