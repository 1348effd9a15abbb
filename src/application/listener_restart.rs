//! Listener restart sequencer
//!
//! On an IP change every transport slot is flipped to `Restarting` first,
//! then one restart task per slot is spawned. Slots finish in any order;
//! the completion that leaves no slot restarting hands the cycle over to
//! the account coordinator, once.

use super::context::{AppContext, Core};
use super::ip_change::CycleState;
use crate::domain::ip_change::{IpChangeInfo, IpChangeOp, IpChangeParam, IpChangeProgress};
use crate::domain::shared::{CycleId, ReachError, Result, Status, TransportId};
use crate::domain::transport::TransportKind;
use crate::domain::account::Account;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Core {
    /// Start an IP-change cycle
    pub(crate) fn handle_ip_change(self: &Arc<Self>, param: IpChangeParam) -> Result<CycleId> {
        let cycle = CycleId::new();
        let slots: Vec<(TransportId, TransportKind, SocketAddr)> = {
            let mut inner = self.lock();
            if let Some(running) = &inner.cycle {
                return Err(ReachError::Busy(format!("IP change cycle {} still running", running.id)));
            }
            inner.cycle = Some(CycleState::new(cycle, param.clone()));
            inner.accounts.values_mut().for_each(Account::reset_ip_change);

            if param.restart_listener {
                inner
                    .transports
                    .values_mut()
                    .map(|slot| {
                        slot.begin_restart();
                        (slot.id, slot.kind, slot.restart_bind_addr())
                    })
                    .collect()
            } else {
                Vec::new()
            }
        };

        metrics::counter!("ip_change_cycles_total").increment(1);
        info!(%cycle, "IP address change: restarting {} listener(s)", slots.len());

        if slots.is_empty() {
            self.hand_off(cycle);
            return Ok(cycle);
        }
        for (id, kind, bind) in slots {
            self.spawn_restart(cycle, id, kind, bind);
        }
        Ok(cycle)
    }

    fn spawn_restart(self: &Arc<Self>, cycle: CycleId, id: TransportId, kind: TransportKind, bind: SocketAddr) {
        let core = self.clone();
        self.handle.spawn(async move {
            core.restart_listener(cycle, id, kind, bind).await;
        });
    }

    async fn restart_listener(self: Arc<Self>, cycle: CycleId, id: TransportId, kind: TransportKind, bind: SocketAddr) {
        let (attempt, param) = {
            let mut inner = self.lock();
            let param = match &inner.cycle {
                Some(state) if state.id == cycle => state.param.clone(),
                _ => return,
            };
            match inner.transports.get_mut(&id) {
                Some(slot) => {
                    slot.restart_attempts += 1;
                    (slot.restart_attempts, param)
                }
                None => return,
            }
        };

        metrics::counter!("listener_restarts_total").increment(1);
        debug!(%cycle, transport = %id, "Restarting {} listener on {} (attempt {})", kind.as_str(), bind, attempt);

        let restarted = if kind.is_datagram() {
            self.listeners.rebind_datagram(id, bind).await
        } else {
            self.listeners.recreate_listener(id, bind).await
        };

        match restarted {
            Ok(local) => {
                info!(%cycle, transport = %id, "Listener restarted on {}", local);
                self.finish_restart(cycle, id, Ok(()), Some(local));
            }
            Err(e) if attempt < param.restart_max_attempts && !param.restart_retry_delay.is_zero() => {
                warn!(
                    %cycle,
                    transport = %id,
                    "Listener restart failed: {}, retrying in {:?}",
                    e,
                    param.restart_retry_delay
                );
                let core = self.clone();
                self.timer.schedule(
                    param.restart_retry_delay,
                    Box::new(move || core.spawn_restart(cycle, id, kind, bind)),
                );
            }
            Err(e) => {
                warn!(%cycle, transport = %id, "Listener restart failed after {} attempt(s): {}", attempt, e);
                self.finish_restart(cycle, id, Err(e), None);
            }
        }
    }

    fn finish_restart(self: &Arc<Self>, cycle: CycleId, id: TransportId, status: Status, local: Option<SocketAddr>) {
        let hand_off = {
            let mut inner = self.lock();
            if let Some(slot) = inner.transports.get_mut(&id) {
                slot.finish_restart(status.clone(), local);
            }
            let remaining = inner.transports.values().filter(|s| s.is_restarting).count();
            debug!(%cycle, "{} listener(s) still restarting", remaining);
            match inner.cycle.as_mut() {
                Some(state) if state.id == cycle && remaining == 0 => state.claim_hand_off(),
                _ => false,
            }
        };

        self.emit(IpChangeProgress {
            cycle,
            op: IpChangeOp::RestartListener,
            status,
            info: IpChangeInfo::Transport { transport: id },
        });

        if hand_off {
            self.hand_off(cycle);
        }
    }

    fn hand_off(self: &Arc<Self>, cycle: CycleId) {
        {
            let mut inner = self.lock();
            match inner.cycle.as_mut() {
                Some(state) if state.id == cycle => {
                    state.claim_hand_off();
                }
                _ => return,
            }
        }
        info!(%cycle, "Listeners settled, handling accounts");
        self.process_accounts(cycle);
    }
}

impl AppContext {
    /// React to a local IP address change.
    ///
    /// Returns immediately; progress is reported through the IP-change
    /// callback. Rejected with `Busy` while the previous cycle runs.
    pub fn handle_ip_change(&self, param: IpChangeParam) -> Result<CycleId> {
        self.core.handle_ip_change(param)
    }

    /// Whether an IP-change cycle is running
    pub fn ip_change_in_progress(&self) -> bool {
        self.core.lock().cycle.is_some()
    }
}
