//! Session façades over the device
//!
//! Both collaborators talk to the device through one small interface,
//! [`Endpoint`], implemented once per side:
//!
//! - [`FrontEnd`] - block I/O at a cursor, driven through the transfer engine
//! - [`AgentSession`] - the control channel: blocking receive of the next
//!   record, reply, and access to the shared buffer
//!
//! Opening an endpoint claims its side of the access gate; closing (or
//! dropping) it gives the side back.

mod agent;
mod front_end;

use std::sync::Arc;

pub use agent::AgentSession;
pub use front_end::FrontEnd;

use crate::device::Device;
use crate::error::DeviceError;
use crate::gate::Side;

/// Lifecycle and byte I/O shared by both session kinds
pub trait Endpoint: Sized {
    /// Which side of the access gate this endpoint occupies
    const SIDE: Side;

    /// Claim the side and start a session
    fn open(device: &Arc<Device>) -> Result<Self, DeviceError>;

    /// Side-specific read. Blocks until data is available.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Side-specific write
    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError>;

    /// End the session and release the side
    fn close(self) {
        drop(self);
    }
}
