//! Address-family order used while walking the STUN server list

use crate::domain::shared::AddressFamily;

/// Decides which families an entry is probed in, and in which order
pub trait FamilyPolicy: Send + Sync + std::fmt::Debug {
    /// Family of the first trial of every entry
    fn first(&self) -> AddressFamily;

    /// Family to retry the same entry in after `current` failed, or
    /// `None` to move on to the next entry
    fn next(&self, current: AddressFamily) -> Option<AddressFamily>;
}

/// IPv4 first, optionally followed by IPv6 on the same entry
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4First {
    pub try_ipv6: bool,
}

impl FamilyPolicy for Ipv4First {
    fn first(&self) -> AddressFamily {
        AddressFamily::V4
    }

    fn next(&self, current: AddressFamily) -> Option<AddressFamily> {
        match current {
            AddressFamily::V4 if self.try_ipv6 => Some(AddressFamily::V6),
            _ => None,
        }
    }
}

/// NAT64 networks: IPv4 is skipped entirely
#[derive(Debug, Clone, Copy, Default)]
pub struct Nat64Only;

impl FamilyPolicy for Nat64Only {
    fn first(&self) -> AddressFamily {
        AddressFamily::V6
    }

    fn next(&self, _current: AddressFamily) -> Option<AddressFamily> {
        None
    }
}
