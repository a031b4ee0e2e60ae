//! usbd - a block device whose storage lives in a user-space agent
//!
//! The front end (the storage stack's side) issues block reads and writes.
//! Each one is cut into chunks no larger than one shared page; every chunk is
//! a synchronous round-trip through a two-phase handshake with the agent, which
//! performs the real I/O against its backend and replies.
//!
//! # Modules
//!
//! - `relay` - the handshake (`RelayState`) and its wire record
//! - `buffer` - the one-page staging area shared by both sides
//! - `gate` - at most one front end and one agent at a time
//! - `transfer` - chunking of logical operations into round-trips
//! - `channel` - the two session façades (`FrontEnd`, `AgentSession`)
//! - `device` - one device instance and its configuration
//! - `agent` - an agent loop serving requests from a file or memory
//! - `metrics` - Prometheus collectors
//! - `telemetry` - subscriber and OTLP setup
//!
//! # Quick Start
//!
//! ```ignore
//! use usbd::{AgentRunner, Device, DeviceConfig, MemoryBackend};
//!
//! let device = Device::new(DeviceConfig::default())?;
//! let mut session = device.open_agent()?;
//! std::thread::spawn(move || {
//!     AgentRunner::new(MemoryBackend::new(1 << 20)).run(&mut session)
//! });
//!
//! let front_end = device.open_front_end()?;
//! front_end.write_at(10, &[0xab; 4000])?;
//! ```

pub mod agent;
pub mod buffer;
pub mod channel;
pub mod device;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod relay;
pub mod telemetry;
pub mod transfer;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentRunner, AgentStats, Backend, FileBackend, MemoryBackend, StopHandle};
pub use buffer::{SharedBuffer, SECTOR_SIZE};
pub use channel::{AgentSession, Endpoint, FrontEnd};
pub use device::{Device, DeviceConfig};
pub use error::{DeviceError, RelayError};
pub use gate::{AccessGate, Side};
pub use relay::{Record, RelayState, RequestKind};
pub use transfer::{IoBuf, TransferEngine, TransferError};
