//! Account IP-change coordinator
//!
//! Runs once the listeners have settled. Decisions for every account are
//! taken under the context lock in one pass over the account table; the
//! SIP work they imply runs afterwards in spawned tasks. Accounts sharing
//! a connection-oriented registration transport are handled as one group
//! so the transport is shut down only once.

use super::context::{Core, Inner};
use crate::domain::account::Account;
use crate::domain::ip_change::{AccountIpChangeState, IpChangeInfo, IpChangeOp, IpChangeParam, IpChangeProgress};
use crate::domain::shared::{AccountId, CycleId, ReachError, Status, TransportId};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Book-keeping of the running cycle
#[derive(Debug, Clone)]
pub(crate) struct CycleState {
    pub id: CycleId,
    pub param: IpChangeParam,
    handed_off: bool,
}

impl CycleState {
    pub fn new(id: CycleId, param: IpChangeParam) -> Self {
        Self {
            id,
            param,
            handed_off: false,
        }
    }

    /// True for the first caller only
    pub fn claim_hand_off(&mut self) -> bool {
        !std::mem::replace(&mut self.handed_off, true)
    }
}

#[derive(Debug)]
enum Plan {
    Abort { account: AccountId, error: ReachError },
    Group { transport: TransportId, members: Vec<AccountId> },
    Single { account: AccountId },
}

impl Core {
    pub(crate) fn process_accounts(self: &Arc<Self>, cycle: CycleId) {
        let plans = {
            let mut inner = self.lock();
            let restarted = inner
                .cycle
                .as_ref()
                .map(|state| state.param.restart_listener)
                .unwrap_or(false);
            plan_accounts(&mut inner, restarted)
        };
        debug!(%cycle, "Account plan: {:?}", plans);

        // Aborts are reported before any task runs, so the final Completed
        // of the cycle cannot overtake them.
        let (aborts, work): (Vec<Plan>, Vec<Plan>) = plans
            .into_iter()
            .partition(|plan| matches!(plan, Plan::Abort { .. }));
        for plan in aborts.into_iter().chain(work) {
            match plan {
                Plan::Abort { account, error } => {
                    warn!(%cycle, %account, "Registration transport did not come back: {}", error);
                    self.emit(IpChangeProgress {
                        cycle,
                        op: IpChangeOp::Completed,
                        status: Err(error),
                        info: IpChangeInfo::Account { account, code: None },
                    });
                }
                Plan::Group { transport, members } => {
                    self.handle
                        .spawn(self.clone().run_group(cycle, transport, members));
                }
                Plan::Single { account } => {
                    self.handle.spawn(self.clone().run_account(cycle, account, false));
                }
            }
        }

        self.check_cycle_done(cycle);
    }

    async fn run_group(self: Arc<Self>, cycle: CycleId, transport: TransportId, members: Vec<AccountId>) {
        info!(
            %cycle,
            %transport,
            "Shutting down transport shared by {} account(s)",
            members.len()
        );
        let status = self.listeners.shutdown(transport).await;
        match &status {
            Ok(()) => {
                if let Some(slot) = self.lock().transports.get_mut(&transport) {
                    slot.is_shutdown = true;
                }
            }
            Err(e) => warn!(%cycle, %transport, "Transport shutdown failed: {}", e),
        }
        self.emit(IpChangeProgress {
            cycle,
            op: IpChangeOp::ShutdownTransport,
            status,
            info: IpChangeInfo::Transport { transport },
        });

        for account in members {
            self.clone().run_account(cycle, account, true).await;
        }
    }

    /// Walk one account through its remaining steps
    async fn run_account(self: Arc<Self>, cycle: CycleId, id: AccountId, fresh_connection: bool) {
        loop {
            let (account, contact) = {
                let inner = self.lock();
                let Some(account) = inner.accounts.get(&id) else {
                    break;
                };
                (account.clone(), contact_for(&inner, account))
            };

            let step = account.ip_change_state;
            match step {
                AccountIpChangeState::UpdateContact => {
                    self.update_contact(cycle, &account, contact, fresh_connection).await
                }
                AccountIpChangeState::HangupCalls => self.hangup_calls(cycle, &account).await,
                AccountIpChangeState::ReinviteCalls => self.reinvite_calls(cycle, &account, contact).await,
                AccountIpChangeState::Completed => {
                    debug!(%cycle, account = %id, "Account handled");
                    self.emit(IpChangeProgress {
                        cycle,
                        op: IpChangeOp::Completed,
                        status: Ok(()),
                        info: IpChangeInfo::Account { account: id, code: None },
                    });
                    break;
                }
                AccountIpChangeState::Null | AccountIpChangeState::ShutdownTransport => {}
            }

            let advanced = {
                let mut inner = self.lock();
                match inner.accounts.get_mut(&id) {
                    Some(account) => {
                        account.ip_change_state = account.next_ip_change_step(step);
                        true
                    }
                    None => false,
                }
            };
            if !advanced {
                break;
            }
        }

        self.check_cycle_done(cycle);
    }

    async fn update_contact(
        &self,
        cycle: CycleId,
        account: &Account,
        contact: Option<SocketAddr>,
        fresh_connection: bool,
    ) {
        let Some(registrar) = &self.registrar else {
            warn!(%cycle, account = %account.id, "No registration client attached, contact not updated");
            return;
        };
        let Some(contact) = contact else {
            self.emit(IpChangeProgress {
                cycle,
                op: IpChangeOp::UpdateContact,
                status: Err(ReachError::Transport("no transport to publish a contact on".to_string())),
                info: IpChangeInfo::Account {
                    account: account.id,
                    code: None,
                },
            });
            return;
        };

        // The old binding can only be removed over a connection that survived.
        if !fresh_connection && account.has_active_registration() {
            if let Err(e) = registrar.unregister(account.id).await {
                debug!(%cycle, account = %account.id, "Unregistering old contact failed: {}", e);
            }
        }

        let (status, code): (Status, u16) = match registrar.register(account.id, contact).await {
            Ok(code) if (200..300).contains(&code) => (Ok(()), code),
            Ok(code) => (
                Err(ReachError::Registration {
                    code,
                    reason: "rejected by registrar".to_string(),
                }),
                code,
            ),
            Err(e) => (Err(e), 0),
        };

        if let Some(entry) = self.lock().accounts.get_mut(&account.id) {
            entry.record_registration(code);
            if entry.has_permanent_failure() {
                warn!(%cycle, account = %account.id, "Registration failed permanently ({})", code);
            }
        }
        info!(%cycle, account = %account.id, "Contact updated to {}: {}", contact, code);

        self.emit(IpChangeProgress {
            cycle,
            op: IpChangeOp::UpdateContact,
            status,
            info: IpChangeInfo::Account {
                account: account.id,
                code: (code != 0).then_some(code),
            },
        });
    }

    async fn hangup_calls(&self, cycle: CycleId, account: &Account) {
        let Some(calls) = &self.calls else {
            warn!(%cycle, account = %account.id, "No call control attached, calls left alone");
            return;
        };
        for call in &account.calls {
            let status = calls.hangup(*call).await;
            if status.is_ok() {
                if let Some(entry) = self.lock().accounts.get_mut(&account.id) {
                    entry.calls.retain(|c| c != call);
                }
            }
            self.emit(IpChangeProgress {
                cycle,
                op: IpChangeOp::HangupCalls,
                status,
                info: IpChangeInfo::Call {
                    account: account.id,
                    call: *call,
                },
            });
        }
    }

    async fn reinvite_calls(&self, cycle: CycleId, account: &Account, contact: Option<SocketAddr>) {
        let Some(calls) = &self.calls else {
            warn!(%cycle, account = %account.id, "No call control attached, calls left alone");
            return;
        };
        for call in &account.calls {
            let status = match contact {
                Some(contact) => match calls.reinvite(*call, contact).await {
                    Ok(code) if (200..300).contains(&code) => Ok(()),
                    Ok(code) => Err(ReachError::Call(format!("re-INVITE answered {}", code))),
                    Err(e) => Err(e),
                },
                None => Err(ReachError::Transport("no transport to publish a contact on".to_string())),
            };
            if let Err(e) = &status {
                warn!(%cycle, account = %account.id, call = %call, "Re-INVITE failed: {}", e);
            }
            self.emit(IpChangeProgress {
                cycle,
                op: IpChangeOp::ReinviteCalls,
                status,
                info: IpChangeInfo::Call {
                    account: account.id,
                    call: *call,
                },
            });
        }
    }

    /// End the cycle once every account is `Completed`
    fn check_cycle_done(&self, cycle: CycleId) {
        let finished = {
            let mut inner = self.lock();
            let all_done = inner
                .accounts
                .values()
                .all(|a| a.ip_change_state == AccountIpChangeState::Completed);
            match &inner.cycle {
                Some(state) if state.id == cycle && state.handed_off && all_done => {
                    inner.cycle = None;
                    true
                }
                _ => false,
            }
        };

        if finished {
            info!(%cycle, "IP change handling completed");
            self.emit(IpChangeProgress {
                cycle,
                op: IpChangeOp::Completed,
                status: Ok(()),
                info: IpChangeInfo::None,
            });
        }
    }
}

/// Decide what happens to every account not yet handled this cycle
fn plan_accounts(inner: &mut Inner, restarted: bool) -> Vec<Plan> {
    let ids: Vec<AccountId> = inner.accounts.keys().copied().collect();
    let mut plans = Vec::new();

    for id in ids {
        let Some(account) = inner.accounts.get(&id) else {
            continue;
        };
        if account.is_done() {
            continue;
        }

        let slot = account.reg_transport.and_then(|t| inner.transports.get(&t));
        let plan = if account.has_permanent_failure() || account.is_idle() {
            None
        } else if let Some(Err(error)) = slot.filter(|_| restarted).and_then(|s| s.last_restart_status.clone()) {
            Some(Plan::Abort { account: id, error })
        } else {
            match slot {
                Some(slot) if slot.kind.is_connection_oriented() && account.config.reg_uri.is_some() => {
                    let transport = slot.id;
                    let members: Vec<&Account> = inner
                        .accounts
                        .values()
                        .filter(|a| {
                            !a.is_done()
                                && !a.has_permanent_failure()
                                && a.config.reg_uri.is_some()
                                && a.reg_transport == Some(transport)
                        })
                        .collect();
                    if members.iter().any(|a| a.config.ip_change.shutdown_transport) {
                        Some(Plan::Group {
                            transport,
                            members: members.iter().map(|a| a.id).collect(),
                        })
                    } else {
                        Some(Plan::Single { account: id })
                    }
                }
                _ => Some(Plan::Single { account: id }),
            }
        };

        match &plan {
            None | Some(Plan::Abort { .. }) => set_state(inner, id, AccountIpChangeState::Completed),
            Some(Plan::Group { members, .. }) => {
                for member in members {
                    set_state(inner, *member, AccountIpChangeState::ShutdownTransport);
                }
            }
            Some(Plan::Single { account }) => {
                if let Some(entry) = inner.accounts.get_mut(account) {
                    entry.ip_change_state = entry.next_ip_change_step(AccountIpChangeState::Null);
                }
            }
        }
        plans.extend(plan);
    }
    plans
}

fn set_state(inner: &mut Inner, id: AccountId, state: AccountIpChangeState) {
    if let Some(account) = inner.accounts.get_mut(&id) {
        account.ip_change_state = state;
    }
}

/// Address to advertise for an account: its registration transport, else
/// the first transport in the table
fn contact_for(inner: &Inner, account: &Account) -> Option<SocketAddr> {
    account
        .reg_transport
        .and_then(|t| inner.transports.get(&t))
        .or_else(|| inner.transports.values().next())
        .map(|slot| slot.published_addr)
}
