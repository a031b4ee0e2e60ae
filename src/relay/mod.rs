//! The handoff protocol: wire record plus the two-phase relay state
//!
//! - `record` - fixed-size request/response record and its wire layout
//! - `state` - the phase machine both parties block on

pub mod record;
pub mod state;

pub use record::{Record, RequestKind, WireError, FAILURE_LENGTH, RECORD_SIZE};
pub use state::{Delivery, Phase, RelayState, RelayStats, Ticket};
