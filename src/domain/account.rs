//! SIP accounts and their IP-change policy

use super::ip_change::AccountIpChangeState;
use super::shared::{AccountId, CallId, ReachError, TransportId};
use serde::{Deserialize, Serialize};

/// What an account does when the local IP address changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountIpChangeConfig {
    /// Shut down the connection-oriented transport the registration uses
    pub shutdown_transport: bool,
    /// Hang up active calls instead of renegotiating them
    pub hangup_calls: bool,
    /// Send a re-INVITE for active calls
    pub reinvite_calls: bool,
}

impl Default for AccountIpChangeConfig {
    fn default() -> Self {
        Self {
            shutdown_transport: true,
            hangup_calls: false,
            reinvite_calls: true,
        }
    }
}

/// Per-account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Account identity, e.g. `sip:alice@example.com`
    pub id_uri: String,
    /// Registrar URI; `None` for accounts that never register
    pub reg_uri: Option<String>,
    /// Re-register with the new local address after an IP change
    pub contact_rewrite: bool,
    pub ip_change: AccountIpChangeConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id_uri: String::new(),
            reg_uri: None,
            contact_rewrite: true,
            ip_change: AccountIpChangeConfig::default(),
        }
    }
}

impl AccountConfig {
    pub fn new(id_uri: impl Into<String>) -> Self {
        Self {
            id_uri: id_uri.into(),
            ..Default::default()
        }
    }

    pub fn with_registrar(mut self, reg_uri: impl Into<String>) -> Self {
        self.reg_uri = Some(reg_uri.into());
        self
    }

    /// Check that the URIs are well-formed SIP URIs
    pub fn validate(&self) -> Result<(), ReachError> {
        Self::check_uri("account", &self.id_uri)?;
        if let Some(reg_uri) = &self.reg_uri {
            Self::check_uri("registrar", reg_uri)?;
        }
        Ok(())
    }

    fn check_uri(what: &str, uri: &str) -> Result<(), ReachError> {
        if !(uri.starts_with("sip:") || uri.starts_with("sips:")) {
            return Err(ReachError::InvalidArgument(format!(
                "{} URI must use the sip or sips scheme: {}",
                what, uri
            )));
        }
        rsip::Uri::try_from(uri)
            .map(|_| ())
            .map_err(|e| ReachError::InvalidArgument(format!("bad {} URI {}: {}", what, uri, e)))
    }
}

/// Registration outcome as last reported by the registration client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Never registered, or unregistered
    Inactive,
    Active { code: u16 },
    Failed { code: u16 },
}

/// Whether a final REGISTER response means retrying is pointless.
///
/// 401/407 are challenges for the auth layer; 408, 480, 500, 502, 503,
/// 504 and transport failures (code 0) are worth another try.
pub fn is_permanent_failure(code: u16) -> bool {
    match code {
        200..=299 => false,
        0 | 401 | 407 | 408 | 480 | 500 | 502 | 503 | 504 => false,
        400..=699 => true,
        _ => false,
    }
}

/// One entry of the account table
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub config: AccountConfig,
    /// Transport the registration is bound to
    pub reg_transport: Option<TransportId>,
    pub registration: RegistrationState,
    pub calls: Vec<CallId>,
    pub ip_change_state: AccountIpChangeState,
}

impl Account {
    pub fn new(id: AccountId, config: AccountConfig) -> Self {
        Self {
            id,
            config,
            reg_transport: None,
            registration: RegistrationState::Inactive,
            calls: Vec::new(),
            ip_change_state: AccountIpChangeState::Completed,
        }
    }

    pub fn has_active_registration(&self) -> bool {
        matches!(self.registration, RegistrationState::Active { .. })
    }

    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn has_permanent_failure(&self) -> bool {
        matches!(self.registration, RegistrationState::Failed { code } if is_permanent_failure(code))
    }

    /// Handled already in the current IP-change cycle
    pub fn is_done(&self) -> bool {
        self.ip_change_state != AccountIpChangeState::Null
    }

    /// Forget the previous cycle
    pub fn reset_ip_change(&mut self) {
        self.ip_change_state = AccountIpChangeState::Null;
    }

    /// Should re-register with the new contact
    pub fn needs_contact_update(&self) -> bool {
        self.config.contact_rewrite && self.config.reg_uri.is_some()
    }

    /// Nothing to re-establish after an IP change
    pub fn is_idle(&self) -> bool {
        self.config.reg_uri.is_none() && !self.has_calls()
    }

    /// State following `current` in the per-account sequence
    pub fn next_ip_change_step(&self, current: AccountIpChangeState) -> AccountIpChangeState {
        use AccountIpChangeState::*;
        let policy = &self.config.ip_change;
        let calls_step = if !self.has_calls() {
            Completed
        } else if policy.hangup_calls {
            HangupCalls
        } else if policy.reinvite_calls {
            ReinviteCalls
        } else {
            Completed
        };
        match current {
            Null | ShutdownTransport if self.needs_contact_update() => UpdateContact,
            Null | ShutdownTransport | UpdateContact => calls_step,
            HangupCalls | ReinviteCalls | Completed => Completed,
        }
    }

    pub fn record_registration(&mut self, code: u16) {
        self.registration = if (200..300).contains(&code) {
            RegistrationState::Active { code }
        } else {
            RegistrationState::Failed { code }
        };
    }
}
