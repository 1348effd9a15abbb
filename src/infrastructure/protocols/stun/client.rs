/// STUN binding prober: name resolution plus one binding transaction
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::message;
use crate::domain::shared::{AddressFamily, ReachError, StunServer};

/// What one successful probe learned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Local endpoint of the probe socket
    pub local: SocketAddr,
    /// Mapping observed by the server
    pub mapped: SocketAddr,
    /// Resolved server address
    pub server: SocketAddr,
}

/// Name-resolution + transport-probe primitive used by resolution sessions.
///
/// One call opens exactly one ephemeral socket of `family` and drops it
/// before returning. The caller bounds the call with its own timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BindingProber: Send + Sync {
    async fn probe(&self, server: &StunServer, family: AddressFamily) -> Result<ProbeOutcome, ReachError>;
}

/// Prober speaking STUN over UDP
#[derive(Debug, Clone)]
pub struct UdpBindingProber {
    /// Initial retransmission timeout, doubled after every loss
    rto: Duration,
    max_transmissions: u32,
    software: String,
}

impl Default for UdpBindingProber {
    fn default() -> Self {
        Self {
            rto: Duration::from_millis(250),
            max_transmissions: 7,
            software: format!("sipreach/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl UdpBindingProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial retransmission timeout
    pub fn with_rto(mut self, rto: Duration) -> Self {
        self.rto = rto;
        self
    }

    async fn resolve(server: &StunServer, family: AddressFamily) -> Result<SocketAddr, ReachError> {
        let addrs = tokio::net::lookup_host((server.host.as_str(), server.port))
            .await
            .map_err(|e| ReachError::Resolve(format!("{}: {}", server, e)))?;
        addrs
            .into_iter()
            .find(|addr| AddressFamily::of(addr) == family)
            .ok_or_else(|| ReachError::Resolve(format!("{} has no {} address", server, family)))
    }
}

#[async_trait]
impl BindingProber for UdpBindingProber {
    async fn probe(&self, server: &StunServer, family: AddressFamily) -> Result<ProbeOutcome, ReachError> {
        let server_addr = Self::resolve(server, family).await?;

        let socket = UdpSocket::bind(family.any())
            .await
            .map_err(|e| ReachError::Socket(format!("bind {} probe socket: {}", family, e)))?;
        // Connecting picks the outgoing interface, so local_addr reports the
        // address the server actually sees us sending from.
        socket
            .connect(server_addr)
            .await
            .map_err(|e| ReachError::Socket(format!("connect to {}: {}", server_addr, e)))?;
        let local = socket.local_addr()?;

        let transaction_id = message::new_transaction_id();
        let request = message::binding_request(&transaction_id, &self.software);

        let mut rto = self.rto;
        let mut buf = [0u8; 1500];
        for attempt in 1..=self.max_transmissions {
            socket
                .send(&request)
                .await
                .map_err(|e| ReachError::Socket(format!("send to {}: {}", server_addr, e)))?;
            trace!(%server_addr, attempt, "Sent STUN binding request");

            match tokio::time::timeout(rto, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let mapped = message::parse_response(&buf[..len], &transaction_id)?;
                    debug!(%server_addr, %local, %mapped, "STUN binding answered");
                    return Ok(ProbeOutcome {
                        local,
                        mapped,
                        server: server_addr,
                    });
                }
                Ok(Err(e)) => {
                    return Err(ReachError::Socket(format!("recv from {}: {}", server_addr, e)));
                }
                Err(_) => rto *= 2,
            }
        }

        Err(ReachError::Timeout)
    }
}
