//! IP-change orchestration integration tests

mod common;

use common::*;
use sipreach::application::AppContext;
use sipreach::domain::account::AccountConfig;
use sipreach::domain::ip_change::{AccountIpChangeState, IpChangeInfo, IpChangeOp, IpChangeParam, IpChangeProgress};
use sipreach::domain::shared::{AccountId, CallId, ReachError, TransportId};
use sipreach::domain::transport::{RestartState, TransportKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    ctx: AppContext,
    listeners: Arc<RecordingListeners>,
    registrar: Arc<RecordingRegistrar>,
    calls: Arc<RecordingCalls>,
    progress: Arc<Mutex<Vec<IpChangeProgress>>>,
}

impl Harness {
    fn new(workers: usize) -> Self {
        let listeners = Arc::new(RecordingListeners::new());
        let registrar = Arc::new(RecordingRegistrar::default());
        let calls = Arc::new(RecordingCalls::default());
        let (callback, progress) = progress_recorder();
        let ctx = AppContext::builder(config(workers, 500))
            .prober(Arc::new(ScriptedProber::new()))
            .listeners(listeners.clone())
            .registration_client(registrar.clone())
            .call_control(calls.clone())
            .on_ip_change(callback)
            .init()
            .unwrap();
        Self {
            ctx,
            listeners,
            registrar,
            calls,
            progress,
        }
    }

    fn transport(&self, kind: TransportKind) -> TransportId {
        self.ctx
            .block_on(self.ctx.create_transport(kind, "0.0.0.0:0".parse().unwrap()))
            .unwrap()
            .unwrap()
    }

    fn account(&self, user: &str, transport: TransportId, shutdown_transport: bool) -> AccountId {
        let mut config = AccountConfig::new(format!("sip:{}@example.com", user)).with_registrar("sip:example.com");
        config.ip_change.shutdown_transport = shutdown_transport;
        let id = self.ctx.add_account(config).unwrap();
        self.ctx.bind_account_transport(id, transport).unwrap();
        self.ctx.set_registration(id, 200).unwrap();
        id
    }

    fn run_cycle(&self, param: IpChangeParam) {
        self.ctx.handle_ip_change(param).unwrap();
        assert!(
            run_until(&self.ctx, Duration::from_secs(2), || !self.ctx.ip_change_in_progress()),
            "IP change cycle did not finish"
        );
    }

    fn ops(&self) -> Vec<IpChangeOp> {
        self.progress.lock().unwrap().iter().map(|p| p.op).collect()
    }

    fn finals(&self) -> usize {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.op == IpChangeOp::Completed && p.info == IpChangeInfo::None)
            .count()
    }
}

#[test]
fn test_hand_off_waits_for_retried_slot() {
    let h = Harness::new(1);
    let a = h.transport(TransportKind::Udp);
    let b = h.transport(TransportKind::Udp);
    let c = h.transport(TransportKind::Udp);
    h.listeners.delay(a, Duration::from_millis(50));
    h.listeners.delay(c, Duration::from_millis(10));
    h.listeners
        .outcomes(b, vec![Err(ReachError::Socket("address not available".into()))]);
    let account = h.account("alice", b, true);

    h.run_cycle(IpChangeParam {
        restart_listener: true,
        restart_retry_delay: Duration::from_millis(80),
        restart_max_attempts: 3,
    });

    assert_eq!(h.listeners.count(b, "rebind"), 2);
    assert_eq!(h.finals(), 1);

    let progress = h.progress.lock().unwrap();
    let restarts: Vec<&IpChangeProgress> = progress
        .iter()
        .filter(|p| p.op == IpChangeOp::RestartListener)
        .collect();
    assert_eq!(restarts.len(), 3);
    assert!(restarts.iter().all(|p| p.status.is_ok()));
    // B is retried after 80 ms, so it settles last.
    assert_eq!(restarts[2].info, IpChangeInfo::Transport { transport: b });

    let first_account_op = progress
        .iter()
        .position(|p| p.op != IpChangeOp::RestartListener)
        .unwrap();
    assert_eq!(first_account_op, 3);
    assert_eq!(
        progress[first_account_op].info,
        IpChangeInfo::Account {
            account,
            code: Some(200)
        }
    );
    drop(progress);

    for id in [a, b, c] {
        assert_eq!(h.ctx.transport_slot(id).unwrap().restart_state(), RestartState::Done(Ok(())));
    }
}

#[test]
fn test_shared_tcp_transport_shut_down_once() {
    let h = Harness::new(0);
    let tcp = h.transport(TransportKind::Tcp);
    let alice = h.account("alice", tcp, true);
    let bob = h.account("bob", tcp, false);

    h.run_cycle(IpChangeParam::default());

    assert_eq!(h.listeners.count(tcp, "recreate"), 1);
    assert_eq!(h.listeners.count(tcp, "shutdown"), 1);
    let shutdowns = h.ops().iter().filter(|op| **op == IpChangeOp::ShutdownTransport).count();
    assert_eq!(shutdowns, 1);

    let registers: Vec<AccountId> = h.registrar.registers.lock().unwrap().iter().map(|(a, _)| *a).collect();
    assert_eq!(registers, vec![alice, bob]);
    // Old bindings died with the connection.
    assert!(h.registrar.unregisters.lock().unwrap().is_empty());

    assert_eq!(h.ctx.account_state(alice), Some(AccountIpChangeState::Completed));
    assert_eq!(h.ctx.account_state(bob), Some(AccountIpChangeState::Completed));
    assert_eq!(h.finals(), 1);
}

#[test]
fn test_shared_tcp_without_shutdown_policy() {
    let h = Harness::new(0);
    let tcp = h.transport(TransportKind::Tcp);
    h.account("alice", tcp, false);
    h.account("bob", tcp, false);

    h.run_cycle(IpChangeParam::default());

    assert_eq!(h.listeners.count(tcp, "shutdown"), 0);
    assert_eq!(h.registrar.registers.lock().unwrap().len(), 2);
    assert_eq!(h.registrar.unregisters.lock().unwrap().len(), 2);
}

#[test]
fn test_exhausted_restart_aborts_account() {
    let h = Harness::new(1);
    let udp = h.transport(TransportKind::Udp);
    let failure = ReachError::Socket("network unreachable".into());
    h.listeners.outcomes(udp, vec![Err(failure.clone()); 3]);
    let account = h.account("carol", udp, true);
    h.ctx.add_call(account, CallId::new()).unwrap();

    h.run_cycle(IpChangeParam {
        restart_listener: true,
        restart_retry_delay: Duration::from_millis(10),
        restart_max_attempts: 3,
    });

    assert_eq!(h.listeners.count(udp, "rebind"), 3);
    let slot = h.ctx.transport_slot(udp).unwrap();
    assert!(slot.restart_failed());
    assert_eq!(slot.restart_attempts, 3);

    let progress = h.progress.lock().unwrap();
    assert!(progress.iter().any(|p| p.op == IpChangeOp::Completed
        && p.status == Err(failure.clone())
        && p.info == IpChangeInfo::Account { account, code: None }));
    assert!(h.registrar.registers.lock().unwrap().is_empty());
    assert!(h.calls.reinvites.lock().unwrap().is_empty());
}

#[test]
fn test_abort_reported_before_cycle_completes() {
    let h = Harness::new(2);
    let broken = h.transport(TransportKind::Udp);
    let healthy = h.transport(TransportKind::Udp);
    let failure = ReachError::Socket("network unreachable".into());
    h.listeners.outcomes(broken, vec![Err(failure.clone())]);
    let stranded = h.account("frank", broken, true);
    let moved = h.account("grace", healthy, true);

    h.run_cycle(IpChangeParam {
        restart_listener: true,
        restart_retry_delay: Duration::ZERO,
        restart_max_attempts: 1,
    });

    let progress = h.progress.lock().unwrap();
    let position = |account: AccountId| {
        progress
            .iter()
            .position(|p| p.op == IpChangeOp::Completed && p.info == IpChangeInfo::Account { account, code: None })
            .unwrap()
    };
    let last = progress.last().unwrap();
    assert_eq!((last.op, &last.info), (IpChangeOp::Completed, &IpChangeInfo::None));
    assert_eq!(progress[position(stranded)].status, Err(failure));
    assert!(position(stranded) < progress.len() - 1);
    assert!(position(moved) < progress.len() - 1);
    assert_eq!(*h.registrar.registers.lock().unwrap(), vec![(moved, h.ctx.transport_slot(healthy).unwrap().published_addr)]);
}

#[test]
fn test_calls_follow_the_new_contact() {
    let h = Harness::new(0);
    let udp = h.transport(TransportKind::Udp);
    let account = h.account("dave", udp, true);
    let call = CallId::new();
    h.ctx.add_call(account, call).unwrap();

    h.run_cycle(IpChangeParam::default());

    let published = h.ctx.transport_slot(udp).unwrap().published_addr;
    assert_eq!(*h.calls.reinvites.lock().unwrap(), vec![(call, published)]);
    assert_eq!(*h.registrar.registers.lock().unwrap(), vec![(account, published)]);
}

#[test]
fn test_consecutive_cycles() {
    let h = Harness::new(0);
    let udp = h.transport(TransportKind::Udp);
    h.account("erin", udp, true);

    h.run_cycle(IpChangeParam::default());
    h.run_cycle(IpChangeParam::default());

    assert_eq!(h.finals(), 2);
    assert_eq!(h.listeners.count(udp, "rebind"), 2);
    assert_eq!(h.registrar.registers.lock().unwrap().len(), 2);
}
