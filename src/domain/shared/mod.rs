//! Shared kernel - types used by every component of the resilience manager

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::ReachError;
pub use result::{Result, Status};
pub use value_objects::*;
