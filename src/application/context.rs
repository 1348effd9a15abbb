//! Application context: the one object holding all resilience state
//!
//! Accounts, transports, STUN sessions and the global STUN state sit
//! behind a single mutex. The mutex is never held across an `.await` or
//! while a host callback runs, so no code path can re-enter it.

use super::ip_change::CycleState;
use super::stun_session::{ResolveSession, SessionId};
use crate::config::Config;
use crate::domain::account::{Account, AccountConfig};
use crate::domain::ip_change::{AccountIpChangeState, IpChangeCallback, IpChangeProgress};
use crate::domain::shared::{AccountId, CallId, ReachError, Result, TransportId};
use crate::domain::stun::{GlobalStunState, NatTypeCallback, ResolveCallback, StunState};
use crate::domain::transport::{TransportKind, TransportSlot};
use crate::infrastructure::event_loop::EventLoop;
use crate::infrastructure::protocols::sip::{CallControl, ListenerControl, RegistrationClient, TokioListeners};
use crate::infrastructure::protocols::stun::{BindingProber, FamilyPolicy, Ipv4First, Nat64Only, UdpBindingProber};
use crate::infrastructure::timer::{Timer, TokioTimer};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Poll slice used by blocking waits
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(10);

/// State guarded by the shared lock
pub(crate) struct Inner {
    pub stun_sessions: HashMap<SessionId, ResolveSession>,
    pub next_session: u64,
    pub stun_servers: Vec<String>,
    pub global_stun: GlobalStunState,
    pub global_session: Option<SessionId>,
    /// Bumped whenever the global resolution restarts or is reset
    pub global_generation: u64,
    pub transports: BTreeMap<TransportId, TransportSlot>,
    pub next_transport: u32,
    pub accounts: BTreeMap<AccountId, Account>,
    pub next_account: u32,
    pub cycle: Option<CycleState>,
}

/// Host application hooks
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub on_stun_resolved: Option<ResolveCallback>,
    pub on_ip_change: Option<IpChangeCallback>,
    pub on_nat_type: Option<NatTypeCallback>,
}

/// Everything tasks spawned on the event loop need
pub(crate) struct Core {
    state: Mutex<Inner>,
    pub config: Config,
    pub handle: Handle,
    pub timer: Arc<dyn Timer>,
    pub family_policy: Arc<dyn FamilyPolicy>,
    pub prober: Arc<dyn BindingProber>,
    pub listeners: Arc<dyn ListenerControl>,
    pub registrar: Option<Arc<dyn RegistrationClient>>,
    pub calls: Option<Arc<dyn CallControl>>,
    pub callbacks: Callbacks,
    pub stun_watch: watch::Sender<StunState>,
}

impl Core {
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn emit(&self, progress: IpChangeProgress) {
        debug!(
            cycle = %progress.cycle,
            op = progress.op.as_str(),
            ok = progress.status.is_ok(),
            "IP change progress: {:?}",
            progress.info
        );
        if let Some(callback) = &self.callbacks.on_ip_change {
            callback(&progress);
        }
    }
}

/// Builder for [`AppContext`]
pub struct AppContextBuilder {
    config: Config,
    family_policy: Option<Arc<dyn FamilyPolicy>>,
    prober: Option<Arc<dyn BindingProber>>,
    listeners: Option<Arc<dyn ListenerControl>>,
    registrar: Option<Arc<dyn RegistrationClient>>,
    calls: Option<Arc<dyn CallControl>>,
    callbacks: Callbacks,
}

impl AppContextBuilder {
    pub fn family_policy(mut self, policy: Arc<dyn FamilyPolicy>) -> Self {
        self.family_policy = Some(policy);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn BindingProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn listeners(mut self, listeners: Arc<dyn ListenerControl>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    pub fn registration_client(mut self, registrar: Arc<dyn RegistrationClient>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn call_control(mut self, calls: Arc<dyn CallControl>) -> Self {
        self.calls = Some(calls);
        self
    }

    pub fn on_stun_resolved(mut self, callback: ResolveCallback) -> Self {
        self.callbacks.on_stun_resolved = Some(callback);
        self
    }

    pub fn on_ip_change(mut self, callback: IpChangeCallback) -> Self {
        self.callbacks.on_ip_change = Some(callback);
        self
    }

    pub fn on_nat_type(mut self, callback: NatTypeCallback) -> Self {
        self.callbacks.on_nat_type = Some(callback);
        self
    }

    /// Start the event loop and build the context
    pub fn init(self) -> Result<AppContext> {
        let event_loop = EventLoop::new(self.config.runtime.worker_threads)?;
        let handle = event_loop.handle();

        let stun = &self.config.stun;
        let family_policy = self.family_policy.unwrap_or_else(|| {
            if stun.nat64 {
                Arc::new(Nat64Only)
            } else {
                Arc::new(Ipv4First {
                    try_ipv6: stun.try_ipv6,
                })
            }
        });

        let inner = Inner {
            stun_sessions: HashMap::new(),
            next_session: 1,
            stun_servers: stun.servers.clone(),
            global_stun: GlobalStunState::new(stun.ignore_failure, stun.try_ipv6),
            global_session: None,
            global_generation: 0,
            transports: BTreeMap::new(),
            next_transport: 0,
            accounts: BTreeMap::new(),
            next_account: 0,
            cycle: None,
        };
        let (stun_watch, _) = watch::channel(StunState::Unknown);

        info!(
            "Resilience context initialised: {} STUN server(s), policy {:?}",
            stun.servers.len(),
            family_policy
        );

        let core = Core {
            state: Mutex::new(inner),
            timer: Arc::new(TokioTimer::new(handle.clone())),
            handle,
            family_policy,
            prober: self
                .prober
                .unwrap_or_else(|| Arc::new(UdpBindingProber::new().with_rto(self.config.stun.rto()))),
            listeners: self.listeners.unwrap_or_else(|| Arc::new(TokioListeners::new())),
            registrar: self.registrar,
            calls: self.calls,
            callbacks: self.callbacks,
            stun_watch,
            config: self.config,
        };

        Ok(AppContext {
            core: Arc::new(core),
            event_loop: Some(event_loop),
        })
    }
}

/// Transport resilience manager instance.
///
/// Construct with [`AppContext::builder`], tear down with
/// [`AppContext::destroy`]. Blocking methods must be called from plain
/// threads, never from inside an async task.
pub struct AppContext {
    pub(crate) core: Arc<Core>,
    event_loop: Option<EventLoop>,
}

impl AppContext {
    pub fn builder(config: Config) -> AppContextBuilder {
        AppContextBuilder {
            config,
            family_policy: None,
            prober: None,
            listeners: None,
            registrar: None,
            calls: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn worker_count(&self) -> usize {
        self.event_loop.as_ref().map(EventLoop::worker_count).unwrap_or(0)
    }

    /// Poll the event loop for at most `max`
    pub fn handle_events(&self, max: Duration) {
        match &self.event_loop {
            Some(event_loop) => event_loop.poll(max),
            None => std::thread::sleep(max),
        }
    }

    /// Run a future on the context's event loop
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        match &self.event_loop {
            Some(event_loop) => Ok(event_loop.block_on(future)),
            None => Err(ReachError::Internal("event loop already stopped".to_string())),
        }
    }

    /// Let the loop make progress for one slice: drive it when nobody else
    /// does, otherwise sleep while the workers run
    pub(crate) fn drive(&self, slice: Duration) {
        if self.worker_count() == 0 {
            self.handle_events(slice);
        } else {
            std::thread::sleep(slice);
        }
    }

    // ---- accounts -------------------------------------------------------

    pub fn add_account(&self, config: AccountConfig) -> Result<AccountId> {
        config.validate()?;
        let mut inner = self.core.lock();
        let id = AccountId(inner.next_account);
        inner.next_account += 1;
        info!("Account {} added: {}", id, config.id_uri);
        inner.accounts.insert(id, Account::new(id, config));
        Ok(id)
    }

    pub fn remove_account(&self, id: AccountId) -> Result<()> {
        self.core
            .lock()
            .accounts
            .remove(&id)
            .map(|_| info!("Account {} removed", id))
            .ok_or_else(|| ReachError::NotFound(format!("account {}", id)))
    }

    /// Bind the account's registration to a transport
    pub fn bind_account_transport(&self, id: AccountId, transport: TransportId) -> Result<()> {
        let mut inner = self.core.lock();
        if !inner.transports.contains_key(&transport) {
            return Err(ReachError::NotFound(format!("transport {}", transport)));
        }
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| ReachError::NotFound(format!("account {}", id)))?;
        account.reg_transport = Some(transport);
        Ok(())
    }

    /// Record the final status of the account's last REGISTER
    pub fn set_registration(&self, id: AccountId, code: u16) -> Result<()> {
        let mut inner = self.core.lock();
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| ReachError::NotFound(format!("account {}", id)))?;
        account.record_registration(code);
        if account.has_permanent_failure() {
            warn!("Account {} registration failed permanently ({})", id, code);
        }
        Ok(())
    }

    pub fn add_call(&self, id: AccountId, call: CallId) -> Result<()> {
        let mut inner = self.core.lock();
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| ReachError::NotFound(format!("account {}", id)))?;
        if !account.calls.contains(&call) {
            account.calls.push(call);
        }
        Ok(())
    }

    pub fn remove_call(&self, id: AccountId, call: CallId) -> Result<()> {
        let mut inner = self.core.lock();
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| ReachError::NotFound(format!("account {}", id)))?;
        account.calls.retain(|c| *c != call);
        Ok(())
    }

    /// Snapshot of an account
    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.core.lock().accounts.get(&id).cloned()
    }

    pub fn account_state(&self, id: AccountId) -> Option<AccountIpChangeState> {
        self.core.lock().accounts.get(&id).map(|a| a.ip_change_state)
    }

    // ---- transports -----------------------------------------------------

    /// Create a listener, publish its address (STUN-mapped when available)
    /// and add it to the transport table
    pub async fn create_transport(&self, kind: TransportKind, bind: SocketAddr) -> Result<TransportId> {
        let id = {
            let mut inner = self.core.lock();
            let id = TransportId(inner.next_transport);
            inner.next_transport += 1;
            id
        };

        let local = self.core.listeners.create(id, kind, bind).await?;
        let published = match self.core.published_address(local).await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.core.listeners.close(id).await;
                return Err(e);
            }
        };

        let mut slot = TransportSlot::new(id, kind, bind, local);
        slot.published_addr = published;
        info!(
            "Transport {} ({}) bound to {}, publishing {}",
            id,
            kind.as_str(),
            local,
            published
        );
        self.core.lock().transports.insert(id, slot);
        Ok(id)
    }

    /// Snapshot of a transport slot
    pub fn transport_slot(&self, id: TransportId) -> Option<TransportSlot> {
        self.core.lock().transports.get(&id).cloned()
    }

    /// Stop everything: silently cancel STUN sessions, close listeners and
    /// shut the event loop down
    pub fn destroy(mut self) {
        info!("Destroying resilience context");
        let (tokens, transports): (Vec<_>, Vec<_>) = {
            let inner = self.core.lock();
            (
                inner.stun_sessions.values().map(|s| s.token).collect(),
                inner.transports.keys().copied().collect(),
            )
        };
        for token in tokens {
            let _ = self.core.cancel_sessions(token, false);
        }

        if let Some(event_loop) = self.event_loop.take() {
            let listeners = self.core.listeners.clone();
            event_loop.block_on(async move {
                for id in transports {
                    if let Err(e) = listeners.close(id).await {
                        warn!("Failed to close transport {}: {}", id, e);
                    }
                }
            });
            event_loop.shutdown(Duration::from_millis(self.core.config.runtime.shutdown_timeout_ms));
        }
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.shutdown_background();
        }
    }
}
