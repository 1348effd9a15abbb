//! Protocol-level collaborators: STUN probing and SIP interfaces

pub mod sip;
pub mod stun;
