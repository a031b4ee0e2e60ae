//! Agent runtime - the user-space side of the relay
//!
//! The agent opens the control channel, then loops: block for the next
//! request, move bytes between its backend and the shared buffer, reply.
//!
//! # Architecture
//!
//! ```text
//! FrontEnd ─► TransferEngine ─► RelayState ─► AgentSession.receive_next()
//!                                                  │
//!                                           AgentRunner.serve()
//!                                                  │
//!                                   Backend (file / memory) ◄─► SharedBuffer
//!                                                  │
//! FrontEnd ◄─ TransferEngine ◄─ RelayState ◄─ AgentSession.reply()
//! ```

pub mod backend;
pub mod runner;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use runner::{AgentRunner, AgentStats, StopHandle};
