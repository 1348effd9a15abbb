/// STUN (Session Traversal Utilities for NAT) probing
/// RFC 5389
pub mod client;
pub mod message;
pub mod policy;

pub use client::{BindingProber, ProbeOutcome, UdpBindingProber};
pub use policy::{FamilyPolicy, Ipv4First, Nat64Only};
