//! SIP collaborators of the resilience manager
//!
//! Message parsing, transactions and dialogs belong to the SIP stack. This
//! module holds the narrow interfaces the IP-change orchestration drives:
//!
//! ```text
//! ┌─────────────────────────┐
//! │  IP-change coordinator  │
//! └──┬──────────┬────────┬──┘
//!    │          │        │
//! ┌──▼─────┐ ┌──▼────┐ ┌─▼──────────┐
//! │Listener│ │ Call  │ │Registration│
//! │Control │ │Control│ │  Client    │
//! └────────┘ └───────┘ └────────────┘
//! ```

pub mod call;
pub mod registration;
pub mod transport;

pub use call::CallControl;
pub use registration::RegistrationClient;
pub use transport::{IncomingData, ListenerControl, TokioListeners};
