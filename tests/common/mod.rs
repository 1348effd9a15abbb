//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use sipreach::application::AppContext;
use sipreach::config::Config;
use sipreach::domain::ip_change::{IpChangeCallback, IpChangeProgress};
use sipreach::domain::shared::{AccountId, AddressFamily, CallId, ReachError, Result, StunServer, TransportId};
use sipreach::domain::stun::{ResolveCallback, StunResolveResult};
use sipreach::domain::transport::TransportKind;
use sipreach::infrastructure::protocols::sip::{CallControl, ListenerControl, RegistrationClient};
use sipreach::infrastructure::protocols::stun::{BindingProber, ProbeOutcome};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How a scripted STUN host behaves
#[derive(Debug, Clone)]
pub enum ProbeScript {
    Answer {
        mapped: SocketAddr,
        delay: Duration,
        only: Option<AddressFamily>,
    },
    Fail(ReachError),
    Hang,
}

/// Prober answering from a per-host script; unknown hosts fail to resolve
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, ProbeScript>>,
    calls: Mutex<Vec<(String, AddressFamily)>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, host: &str, script: ProbeScript) -> Self {
        self.scripts.lock().unwrap().insert(host.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<(String, AddressFamily)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BindingProber for ScriptedProber {
    async fn probe(&self, server: &StunServer, family: AddressFamily) -> Result<ProbeOutcome> {
        self.calls.lock().unwrap().push((server.host.clone(), family));
        let script = self.scripts.lock().unwrap().get(&server.host).cloned();
        match script {
            Some(ProbeScript::Answer { mapped, delay, only }) => {
                tokio::time::sleep(delay).await;
                if only.is_some_and(|f| f != family) {
                    return Err(ReachError::Resolve(format!("{} has no {} address", server.host, family)));
                }
                Ok(ProbeOutcome {
                    local: SocketAddr::new(family.any().ip(), 40000),
                    mapped,
                    server: SocketAddr::new(family.any().ip(), server.port),
                })
            }
            Some(ProbeScript::Fail(e)) => Err(e),
            Some(ProbeScript::Hang) => std::future::pending().await,
            None => Err(ReachError::Resolve(format!("unknown host {}", server.host))),
        }
    }
}

/// Listener set with scripted restart delays and outcomes
#[derive(Default)]
pub struct RecordingListeners {
    delays: Mutex<HashMap<TransportId, Duration>>,
    outcomes: Mutex<HashMap<TransportId, VecDeque<Result<()>>>>,
    log: Mutex<Vec<(TransportId, &'static str, Instant)>>,
}

impl RecordingListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&self, id: TransportId, delay: Duration) {
        self.delays.lock().unwrap().insert(id, delay);
    }

    /// Queue outcomes for successive restarts; once drained restarts succeed
    pub fn outcomes(&self, id: TransportId, outcomes: Vec<Result<()>>) {
        self.outcomes.lock().unwrap().insert(id, outcomes.into());
    }

    pub fn count(&self, id: TransportId, op: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, o, _)| *t == id && *o == op)
            .count()
    }

    pub fn total(&self, op: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|(_, o, _)| *o == op).count()
    }

    fn addr(id: TransportId) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5060 + id.0 as u16))
    }

    async fn restart(&self, id: TransportId, op: &'static str) -> Result<SocketAddr> {
        let delay = self.delays.lock().unwrap().get(&id).copied().unwrap_or_default();
        tokio::time::sleep(delay).await;
        self.log.lock().unwrap().push((id, op, Instant::now()));
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));
        outcome.map(|()| Self::addr(id))
    }
}

#[async_trait]
impl ListenerControl for RecordingListeners {
    async fn create(&self, id: TransportId, _kind: TransportKind, _bind: SocketAddr) -> Result<SocketAddr> {
        self.log.lock().unwrap().push((id, "create", Instant::now()));
        Ok(Self::addr(id))
    }

    async fn rebind_datagram(&self, id: TransportId, _bind: SocketAddr) -> Result<SocketAddr> {
        self.restart(id, "rebind").await
    }

    async fn recreate_listener(&self, id: TransportId, _bind: SocketAddr) -> Result<SocketAddr> {
        self.restart(id, "recreate").await
    }

    async fn shutdown(&self, id: TransportId) -> Result<()> {
        self.log.lock().unwrap().push((id, "shutdown", Instant::now()));
        Ok(())
    }

    async fn close(&self, id: TransportId) -> Result<()> {
        self.log.lock().unwrap().push((id, "close", Instant::now()));
        Ok(())
    }
}

/// Registration client accepting every REGISTER
#[derive(Default)]
pub struct RecordingRegistrar {
    pub registers: Mutex<Vec<(AccountId, SocketAddr)>>,
    pub unregisters: Mutex<Vec<AccountId>>,
}

#[async_trait]
impl RegistrationClient for RecordingRegistrar {
    async fn register(&self, account: AccountId, contact: SocketAddr) -> Result<u16> {
        self.registers.lock().unwrap().push((account, contact));
        Ok(200)
    }

    async fn unregister(&self, account: AccountId) -> Result<u16> {
        self.unregisters.lock().unwrap().push(account);
        Ok(200)
    }
}

#[derive(Default)]
pub struct RecordingCalls {
    pub hangups: Mutex<Vec<CallId>>,
    pub reinvites: Mutex<Vec<(CallId, SocketAddr)>>,
}

#[async_trait]
impl CallControl for RecordingCalls {
    async fn hangup(&self, call: CallId) -> Result<()> {
        self.hangups.lock().unwrap().push(call);
        Ok(())
    }

    async fn reinvite(&self, call: CallId, contact: SocketAddr) -> Result<u16> {
        self.reinvites.lock().unwrap().push((call, contact));
        Ok(200)
    }
}

pub fn config(workers: usize, trial_timeout_ms: u64) -> Config {
    let mut config = Config::default();
    config.runtime.worker_threads = workers;
    config.stun.timeout_ms = trial_timeout_ms;
    config
}

pub fn stun_recorder() -> (ResolveCallback, Arc<Mutex<Vec<StunResolveResult>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ResolveCallback = Arc::new(move |r: &StunResolveResult| sink.lock().unwrap().push(r.clone()));
    (callback, seen)
}

pub fn progress_recorder() -> (IpChangeCallback, Arc<Mutex<Vec<IpChangeProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: IpChangeCallback = Arc::new(move |p: &IpChangeProgress| sink.lock().unwrap().push(p.clone()));
    (callback, seen)
}

/// Let the context run until `done` holds or `limit` passes
pub fn run_until(ctx: &AppContext, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        ctx.handle_events(Duration::from_millis(5));
    }
    done()
}

pub fn mapped() -> SocketAddr {
    "203.0.113.20:40000".parse().unwrap()
}
