//! SIP transport slots as seen by the restart sequencer

use super::shared::{AddressFamily, Status, TransportId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Transport protocol and address family of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Udp6,
    Tcp,
    Tcp6,
    Tls,
    Tls6,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Udp6 => "UDP6",
            TransportKind::Tcp => "TCP",
            TransportKind::Tcp6 => "TCP6",
            TransportKind::Tls => "TLS",
            TransportKind::Tls6 => "TLS6",
        }
    }

    /// Datagram sockets are rebound in place; everything else is a
    /// listener that has to be recreated.
    pub fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Udp | TransportKind::Udp6)
    }

    pub fn is_connection_oriented(&self) -> bool {
        !self.is_datagram()
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            TransportKind::Udp | TransportKind::Tcp | TransportKind::Tls => AddressFamily::V4,
            TransportKind::Udp6 | TransportKind::Tcp6 | TransportKind::Tls6 => AddressFamily::V6,
        }
    }
}

/// Restart progress of one slot within an IP-change cycle
#[derive(Debug, Clone, PartialEq)]
pub enum RestartState {
    Idle,
    Restarting,
    Done(Status),
}

/// One entry of the transport table
#[derive(Debug, Clone)]
pub struct TransportSlot {
    pub id: TransportId,
    pub kind: TransportKind,
    /// Address the listener was configured to bind
    pub bind_addr: SocketAddr,
    /// Address the listener is currently bound to
    pub local_addr: SocketAddr,
    /// Address advertised in Contact/Via
    pub published_addr: SocketAddr,
    pub is_restarting: bool,
    pub last_restart_status: Option<Status>,
    /// Attempts made in the current cycle
    pub restart_attempts: u32,
    pub is_shutdown: bool,
}

impl TransportSlot {
    pub fn new(id: TransportId, kind: TransportKind, bind_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            id,
            kind,
            bind_addr,
            local_addr,
            published_addr: local_addr,
            is_restarting: false,
            last_restart_status: None,
            restart_attempts: 0,
            is_shutdown: false,
        }
    }

    pub fn restart_state(&self) -> RestartState {
        match (&self.is_restarting, &self.last_restart_status) {
            (true, _) => RestartState::Restarting,
            (false, Some(status)) => RestartState::Done(status.clone()),
            (false, None) => RestartState::Idle,
        }
    }

    /// Bind address for a restart: same port, current interface set
    pub fn restart_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr.ip(), self.local_addr.port())
    }

    pub fn restart_failed(&self) -> bool {
        matches!(self.last_restart_status, Some(Err(_)))
    }

    pub fn begin_restart(&mut self) {
        self.is_restarting = true;
        self.last_restart_status = None;
        self.restart_attempts = 0;
    }

    pub fn finish_restart(&mut self, status: Status, local_addr: Option<SocketAddr>) {
        self.is_restarting = false;
        if let Some(addr) = local_addr {
            // Keep the published IP when it came from STUN, follow the new port.
            if self.published_addr == self.local_addr {
                self.published_addr = addr;
            } else {
                self.published_addr.set_port(addr.port());
            }
            self.local_addr = addr;
            self.is_shutdown = false;
        }
        self.last_restart_status = Some(status);
    }
}
