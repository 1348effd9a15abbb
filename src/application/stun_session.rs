//! STUN resolution sessions
//!
//! A session walks a list of STUN server entries, one probe in flight at a
//! time, until one entry answers or the list is exhausted. Exactly one
//! result is delivered per session, whether it comes from a probe, a
//! cancellation or the blocking deadline. Sessions are reference counted:
//! the completion holds one reference and a blocking caller holds another.
//! The session is destroyed from a zero-delay timer task once no reference
//! remains, never on the stack of the code that released it.

use super::context::{AppContext, Core, Inner, WAIT_SLICE};
use crate::domain::shared::{AddressFamily, ReachError, Result, Status, StunServer, StunToken};
use crate::domain::stun::{ResolveCallback, ResolveStatus, StunResolveResult};
use crate::infrastructure::event_loop::in_async_context;
use crate::infrastructure::protocols::stun::FamilyPolicy;
use crate::infrastructure::timer::TimerHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Blocking deadline multiplier over `servers × trial timeout`
pub const STUN_WAIT_BACKOFF: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stun#{}", self.0)
    }
}

pub(crate) struct ResolveSession {
    pub id: SessionId,
    pub token: StunToken,
    pub servers: Vec<String>,
    pub index: usize,
    pub family: AddressFamily,
    /// The one trial in flight: entry index and family
    pub probe: Option<(usize, AddressFamily)>,
    pub policy: Arc<dyn FamilyPolicy>,
    pub callback: ResolveCallback,
    pub blocking: bool,
    pub owner: ThreadId,
    pub refs: u32,
    /// A result was claimed; no further trial or report may happen
    pub has_result: bool,
    /// Final status, latched once the completion has released its reference
    pub status: Option<Status>,
    pub last_error: Option<ReachError>,
    pub deadline: Instant,
    pub destroy_timer: Option<TimerHandle>,
}

impl Core {
    /// Create a session and start its first trial
    pub(crate) fn start_session(
        self: &Arc<Self>,
        servers: &[String],
        token: StunToken,
        callback: ResolveCallback,
        blocking: bool,
    ) -> Result<SessionId> {
        let mut inner = self.lock();
        self.start_session_locked(&mut inner, servers, token, callback, blocking)
    }

    /// Same as [`Core::start_session`] for callers already holding the lock.
    /// The trial task cannot observe the session before the lock is
    /// released.
    pub(crate) fn start_session_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        servers: &[String],
        token: StunToken,
        callback: ResolveCallback,
        blocking: bool,
    ) -> Result<SessionId> {
        if servers.is_empty() {
            return Err(ReachError::InvalidArgument("empty STUN server list".to_string()));
        }

        let trial_timeout = self.config.stun.timeout();
        let budget = trial_timeout
            .saturating_mul(servers.len() as u32)
            .saturating_mul(STUN_WAIT_BACKOFF);
        let policy = self.family_policy.clone();

        let id = SessionId(inner.next_session);
        inner.next_session += 1;
        let session = ResolveSession {
            id,
            token,
            servers: servers.to_vec(),
            index: 0,
            family: policy.first(),
            probe: None,
            policy,
            callback,
            blocking,
            owner: thread::current().id(),
            refs: if blocking { 2 } else { 1 },
            has_result: false,
            status: None,
            last_error: None,
            deadline: Instant::now() + budget,
            destroy_timer: None,
        };
        inner.stun_sessions.insert(id, session);

        debug!(
            session = %id,
            token = token.0,
            "Resolving {} STUN server(s), blocking={}",
            servers.len(),
            blocking
        );
        self.handle.spawn(run_trials(self.clone(), id, trial_timeout));
        Ok(id)
    }

    /// Record a failed trial and move to the next family or entry.
    ///
    /// Returns the error to finish the session with when nothing is left.
    fn advance(&self, id: SessionId, err: ReachError) -> Option<ReachError> {
        let mut inner = self.lock();
        let session = inner.stun_sessions.get_mut(&id)?;
        session.probe = None;
        session.last_error = Some(err.clone());
        if session.has_result {
            return None;
        }
        if Instant::now() >= session.deadline {
            return Some(ReachError::Timeout);
        }

        match session.policy.next(session.family) {
            Some(family) => session.family = family,
            None => {
                session.index += 1;
                session.family = session.policy.first();
            }
        }
        if session.index >= session.servers.len() {
            Some(err)
        } else {
            None
        }
    }

    /// Deliver the session's single result.
    ///
    /// The first caller wins; later calls return without effect. The
    /// callback runs without the lock held, then the completion reference
    /// is released and the status becomes visible to a blocking waiter.
    pub(crate) fn complete(
        self: &Arc<Self>,
        id: SessionId,
        status: Status,
        answer: Option<(usize, SocketAddr)>,
        notify: bool,
    ) {
        let (callback, result) = {
            let mut inner = self.lock();
            let Some(session) = inner.stun_sessions.get_mut(&id) else {
                return;
            };
            if session.has_result {
                debug!(session = %id, "Duplicate completion suppressed");
                return;
            }
            session.has_result = true;
            session.probe = None;

            let result = StunResolveResult {
                token: session.token,
                status: status.clone(),
                name: answer.map(|(index, _)| session.servers[index].clone()),
                addr: answer.map(|(_, addr)| addr),
                index: answer.map(|(index, _)| index),
            };
            (session.callback.clone(), result)
        };

        match (&result.status, &result.addr) {
            (Ok(()), Some(addr)) => info!(
                session = %id,
                "STUN resolved via {}: {}",
                result.name.as_deref().unwrap_or("?"),
                addr
            ),
            (Err(e), _) => warn!(session = %id, "STUN resolution failed: {}", e),
            _ => {}
        }

        if notify {
            callback(&result);
        }

        // Latch and release together so a blocking waiter always drops the
        // last reference.
        let mut inner = self.lock();
        if let Some(session) = inner.stun_sessions.get_mut(&id) {
            session.status = Some(status);
        }
        self.release_locked(&mut inner, id);
    }

    /// Drop one reference; schedule destruction when none remain
    pub(crate) fn release(self: &Arc<Self>, id: SessionId) {
        let mut inner = self.lock();
        self.release_locked(&mut inner, id);
    }

    fn release_locked(self: &Arc<Self>, inner: &mut Inner, id: SessionId) {
        let Some(session) = inner.stun_sessions.get_mut(&id) else {
            return;
        };
        session.refs = session.refs.saturating_sub(1);
        if session.refs > 0 || session.destroy_timer.is_some() {
            return;
        }
        if session.blocking && session.owner != thread::current().id() {
            debug!(session = %id, "Destruction left to the initiating thread");
            return;
        }

        let core = Arc::downgrade(self);
        let timer = self.timer.schedule(
            Duration::ZERO,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.destroy_session(id);
                }
            }),
        );
        session.destroy_timer = Some(timer);
    }

    fn destroy_session(&self, id: SessionId) {
        if let Some(session) = self.lock().stun_sessions.remove(&id) {
            debug!(
                session = %id,
                "Session destroyed after {} entr(ies), last error {:?}",
                session.index.min(session.servers.len()),
                session.last_error
            );
        }
    }

    /// Cancel every unfinished session carrying `token`
    pub(crate) fn cancel_sessions(self: &Arc<Self>, token: StunToken, notify: bool) -> Result<usize> {
        let targets: Vec<(SessionId, Option<(usize, AddressFamily)>)> = self
            .lock()
            .stun_sessions
            .values()
            .filter(|s| s.token == token && !s.has_result)
            .map(|s| (s.id, s.probe))
            .collect();
        if targets.is_empty() {
            return Err(ReachError::NotFound(format!("no STUN resolution with token {}", token.0)));
        }

        for (id, probe) in &targets {
            debug!(session = %id, "Cancelling STUN resolution, trial in flight: {:?}", probe);
            self.complete(*id, Err(ReachError::Cancelled), None, notify);
        }
        Ok(targets.len())
    }

    pub(crate) fn session_count(&self) -> usize {
        self.lock().stun_sessions.len()
    }
}

/// Trial loop of one session: probe, then advance, until a result exists
async fn run_trials(core: Arc<Core>, id: SessionId, trial_timeout: Duration) {
    loop {
        let (entry, index, family) = {
            let mut inner = core.lock();
            let Some(session) = inner.stun_sessions.get_mut(&id) else {
                return;
            };
            if session.has_result {
                return;
            }
            session.probe = Some((session.index, session.family));
            (session.servers[session.index].clone(), session.index, session.family)
        };

        metrics::counter!("stun_trials_total").increment(1);
        debug!(session = %id, "Trial {} over {}", entry, family);

        let outcome = match StunServer::parse(&entry) {
            Ok(server) => match tokio::time::timeout(trial_timeout, core.prober.probe(&server, family)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ReachError::Timeout),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                core.complete(id, Ok(()), Some((index, outcome.mapped)), true);
                return;
            }
            Err(e) => {
                metrics::counter!("stun_trial_failures_total").increment(1);
                if e.is_trial_error() {
                    warn!(session = %id, "STUN trial {} over {} failed: {}", entry, family, e);
                } else {
                    error!(session = %id, "STUN trial {} over {} failed unexpectedly: {}", entry, family, e);
                }
                if let Some(last) = core.advance(id, e) {
                    core.complete(id, Err(last), None, true);
                    return;
                }
            }
        }
    }
}

impl AppContext {
    /// Resolve the mapped address through the first answering server.
    ///
    /// Non-blocking calls return `Pending` and report through `callback`.
    /// Blocking calls return `Done` with the final status; the callback
    /// has been invoked by then. Blocking from inside an async task is
    /// rejected.
    pub fn resolve_stun_servers(
        &self,
        servers: &[String],
        token: StunToken,
        callback: ResolveCallback,
        wait: bool,
    ) -> Result<ResolveStatus> {
        if wait && in_async_context() {
            return Err(ReachError::InvalidArgument(
                "blocking STUN resolution requested from an async context".to_string(),
            ));
        }
        let id = self.core.start_session(servers, token, callback, wait)?;
        if !wait {
            return Ok(ResolveStatus::Pending);
        }
        Ok(ResolveStatus::Done(self.wait_session(id)))
    }

    /// Cancel resolutions carrying `token`; returns how many were cancelled
    pub fn cancel_stun_resolution(&self, token: StunToken, notify: bool) -> Result<usize> {
        self.core.cancel_sessions(token, notify)
    }

    /// Live resolution sessions, including those awaiting destruction
    pub fn stun_session_count(&self) -> usize {
        self.core.session_count()
    }

    fn wait_session(&self, id: SessionId) -> Status {
        let status = loop {
            let (latched, deadline) = {
                let inner = self.core.lock();
                match inner.stun_sessions.get(&id) {
                    Some(session) => (session.status.clone(), session.deadline),
                    None => {
                        break Err(ReachError::Internal(format!("session {} vanished", id)));
                    }
                }
            };
            if let Some(status) = latched {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(session = %id, "Blocking STUN resolution exceeded its deadline");
                self.core.complete(id, Err(ReachError::Timeout), None, true);
                continue;
            }
            self.drive(WAIT_SLICE);
        };

        self.core.release(id);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::infrastructure::protocols::stun::client::{MockBindingProber, ProbeOutcome};
    use std::sync::Mutex;

    fn config(workers: usize, timeout_ms: u64) -> Config {
        let mut config = Config::default();
        config.runtime.worker_threads = workers;
        config.stun.timeout_ms = timeout_ms;
        config
    }

    fn recorder() -> (ResolveCallback, Arc<Mutex<Vec<StunResolveResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ResolveCallback = Arc::new(move |r: &StunResolveResult| {
            sink.lock().unwrap().push(r.clone());
        });
        (callback, seen)
    }

    fn mapped() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    #[test]
    fn test_second_entry_answers() {
        let mut prober = MockBindingProber::new();
        prober.expect_probe().returning(|server, _| {
            if server.host == "bad.invalid" {
                Err(ReachError::Resolve("no such host".into()))
            } else {
                Ok(ProbeOutcome {
                    local: "0.0.0.0:40000".parse().unwrap(),
                    mapped: mapped(),
                    server: "192.0.2.1:3478".parse().unwrap(),
                })
            }
        });

        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(prober))
            .init()
            .unwrap();
        let (callback, seen) = recorder();
        let servers = vec!["bad.invalid".to_string(), "good.example:3478".to_string()];

        let status = ctx
            .resolve_stun_servers(&servers, StunToken(9), callback, true)
            .unwrap();
        assert_eq!(status, ResolveStatus::Done(Ok(())));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].index, Some(1));
        assert_eq!(seen[0].name.as_deref(), Some("good.example:3478"));
        assert_eq!(seen[0].addr, Some(mapped()));
        assert_eq!(seen[0].token, StunToken(9));
    }

    #[test]
    fn test_exhausted_list_reports_last_error() {
        let mut prober = MockBindingProber::new();
        prober
            .expect_probe()
            .times(2)
            .returning(|server, _| Err(ReachError::Probe(format!("{} refused", server.host))));

        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(prober))
            .init()
            .unwrap();
        let (callback, seen) = recorder();
        let servers = vec!["a.example".to_string(), "b.example".to_string()];

        let status = ctx
            .resolve_stun_servers(&servers, StunToken(1), callback, true)
            .unwrap();
        assert_eq!(
            status,
            ResolveStatus::Done(Err(ReachError::Probe("b.example refused".into())))
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let mut prober = MockBindingProber::new();
        prober.expect_probe().times(1).returning(|_, _| {
            Ok(ProbeOutcome {
                local: "0.0.0.0:40000".parse().unwrap(),
                mapped: "203.0.113.7:40000".parse().unwrap(),
                server: "192.0.2.1:3478".parse().unwrap(),
            })
        });

        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(prober))
            .init()
            .unwrap();
        let (callback, seen) = recorder();
        let servers = vec!["host:notaport".to_string(), "ok.example".to_string()];

        ctx.resolve_stun_servers(&servers, StunToken(2), callback, true)
            .unwrap();
        assert_eq!(seen.lock().unwrap()[0].index, Some(1));
    }

    #[test]
    fn test_empty_list_rejected() {
        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(MockBindingProber::new()))
            .init()
            .unwrap();
        let (callback, seen) = recorder();
        let result = ctx.resolve_stun_servers(&[], StunToken(3), callback, false);
        assert!(matches!(result, Err(ReachError::InvalidArgument(_))));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_unknown_token() {
        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(MockBindingProber::new()))
            .init()
            .unwrap();
        assert!(matches!(
            ctx.cancel_stun_resolution(StunToken(42), true),
            Err(ReachError::NotFound(_))
        ));
    }

    #[test]
    fn test_session_destroyed_after_completion() {
        let mut prober = MockBindingProber::new();
        prober.expect_probe().returning(|_, _| {
            Ok(ProbeOutcome {
                local: "0.0.0.0:40000".parse().unwrap(),
                mapped: "203.0.113.7:40000".parse().unwrap(),
                server: "192.0.2.1:3478".parse().unwrap(),
            })
        });
        let ctx = AppContext::builder(config(0, 500))
            .prober(Arc::new(prober))
            .init()
            .unwrap();
        let (callback, _seen) = recorder();

        ctx.resolve_stun_servers(&["a.example".to_string()], StunToken(4), callback, true)
            .unwrap();
        ctx.handle_events(Duration::from_millis(20));
        assert_eq!(ctx.stun_session_count(), 0);
    }

    #[test]
    fn test_blocking_from_async_context_rejected() {
        let ctx = AppContext::builder(config(1, 500))
            .prober(Arc::new(MockBindingProber::new()))
            .init()
            .unwrap();
        let (callback, _seen) = recorder();
        let servers = vec!["a.example".to_string()];

        let rejected = ctx
            .block_on(async { ctx.resolve_stun_servers(&servers, StunToken(5), callback, true) })
            .unwrap();
        assert!(matches!(rejected, Err(ReachError::InvalidArgument(_))));
    }

    #[test]
    fn test_foreign_thread_never_destroys_blocking_session() {
        let mut prober = MockBindingProber::new();
        prober
            .expect_probe()
            .returning(|_, _| Err(ReachError::Probe("refused".into())));
        let ctx = AppContext::builder(config(1, 500))
            .prober(Arc::new(prober))
            .init()
            .unwrap();
        let (callback, seen) = recorder();

        let id = ctx
            .core
            .start_session(&["a.example".to_string()], StunToken(6), callback, true)
            .unwrap();
        for _ in 0..100 {
            if ctx.core.lock().stun_sessions[&id].status.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.lock().unwrap().len(), 1);

        // The waiter's reference dropped from a thread that did not start it.
        let core = ctx.core.clone();
        std::thread::spawn(move || core.release(id)).join().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(ctx.stun_session_count(), 1);
        let inner = ctx.core.lock();
        assert_eq!(inner.stun_sessions[&id].refs, 0);
        assert!(inner.stun_sessions[&id].destroy_timer.is_none());
    }
}
