//! Shared value objects

use super::error::ReachError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

/// Well-known STUN port (RFC 5389)
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Call identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one IP-change cycle, used to correlate log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account table index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acc#{}", self.0)
    }
}

/// Transport table index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportId(pub u32);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp#{}", self.0)
    }
}

/// Opaque caller token attached to a STUN resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StunToken(pub u64);

impl fmt::Display for StunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// IP address family of a probe socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Wildcard address with an ephemeral port
    pub fn any(&self) -> SocketAddr {
        match self {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddressFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `host[:port]` STUN server entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    ///
    /// An unbracketed IPv6 literal is taken as a host without port.
    pub fn parse(entry: &str) -> Result<Self, ReachError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ReachError::Parse("empty server entry".to_string()));
        }

        if let Some(rest) = entry.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ReachError::Parse(format!("unterminated '[' in {}", entry)))?;
            let port = match tail {
                "" => DEFAULT_STUN_PORT,
                _ => {
                    let port = tail.strip_prefix(':').ok_or_else(|| {
                        ReachError::Parse(format!("unexpected text after ']' in {}", entry))
                    })?;
                    Self::parse_port(entry, port)?
                }
            };
            return Self::build(entry, host, port);
        }

        if entry.parse::<Ipv6Addr>().is_ok() {
            return Self::build(entry, entry, DEFAULT_STUN_PORT);
        }

        match entry.rsplit_once(':') {
            Some((host, port)) => Self::build(entry, host, Self::parse_port(entry, port)?),
            None => Self::build(entry, entry, DEFAULT_STUN_PORT),
        }
    }

    fn parse_port(entry: &str, port: &str) -> Result<u16, ReachError> {
        match port.parse::<u16>() {
            Ok(0) | Err(_) => Err(ReachError::Parse(format!("invalid port in {}", entry))),
            Ok(port) => Ok(port),
        }
    }

    fn build(entry: &str, host: &str, port: u16) -> Result<Self, ReachError> {
        if host.is_empty() {
            return Err(ReachError::Parse(format!("missing host in {}", entry)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_with_port() {
        let server = StunServer::parse("stun.example.org:19302").unwrap();
        assert_eq!(server.host, "stun.example.org");
        assert_eq!(server.port, 19302);
    }

    #[test]
    fn test_parse_default_port() {
        let server = StunServer::parse("stun.example.org").unwrap();
        assert_eq!(server.port, DEFAULT_STUN_PORT);
    }

    #[test]
    fn test_parse_ipv6_forms() {
        let bracketed = StunServer::parse("[2001:db8::1]:3479").unwrap();
        assert_eq!(bracketed.host, "2001:db8::1");
        assert_eq!(bracketed.port, 3479);

        let bare = StunServer::parse("2001:db8::1").unwrap();
        assert_eq!(bare.host, "2001:db8::1");
        assert_eq!(bare.port, DEFAULT_STUN_PORT);

        assert_eq!(bracketed.to_string(), "[2001:db8::1]:3479");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StunServer::parse("").is_err());
        assert!(StunServer::parse(":3478").is_err());
        assert!(StunServer::parse("host:notaport").is_err());
        assert!(StunServer::parse("host:0").is_err());
        assert!(StunServer::parse("[::1").is_err());
        assert!(StunServer::parse("[::1]x").is_err());
    }

    #[test]
    fn test_family_wildcard() {
        assert!(AddressFamily::V4.any().is_ipv4());
        assert!(AddressFamily::V6.any().is_ipv6());
        assert_eq!(AddressFamily::of(&"[::1]:5060".parse().unwrap()), AddressFamily::V6);
    }
}
