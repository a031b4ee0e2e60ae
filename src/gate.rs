//! AccessGate - at most one session per side
//!
//! The protocol is only well-defined with a single front end and a single
//! agent. A second opener on either side is turned away immediately with
//! `Busy`; nothing ever queues behind an open session.
//!
//! Session objects ([`crate::FrontEnd`], [`crate::AgentSession`]) open their
//! side on construction and close it on drop, so every exit path, including
//! error paths, gives the slot back.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DeviceError;
use crate::metrics::{SESSIONS_OPEN, SESSION_REJECTIONS};

/// The two parties of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Side {
    /// Originates block I/O
    FrontEnd,
    /// Performs the I/O against real storage
    Agent,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::FrontEnd => "front-end",
            Side::Agent => "agent",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct OpenCounts {
    front_end: u32,
    agent: u32,
}

impl OpenCounts {
    fn slot(&mut self, side: Side) -> &mut u32 {
        match side {
            Side::FrontEnd => &mut self.front_end,
            Side::Agent => &mut self.agent,
        }
    }
}

/// Two independent 0/1 open counters
#[derive(Default)]
pub struct AccessGate {
    counts: Mutex<OpenCounts>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OpenCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `side`, failing fast if it is already held
    pub fn open(&self, side: Side) -> Result<(), DeviceError> {
        let mut counts = self.lock();
        let count = counts.slot(side);
        if *count > 0 {
            SESSION_REJECTIONS.with_label_values(&[side.as_str()]).inc();
            debug!(side = %side, "Rejecting second session");
            return Err(DeviceError::Busy(side));
        }
        *count = 1;
        SESSIONS_OPEN.with_label_values(&[side.as_str()]).set(1);
        Ok(())
    }

    /// Release `side`. Closing a side that is not open is a no-op.
    ///
    /// Returns whether the side was open.
    pub fn close(&self, side: Side) -> bool {
        let mut counts = self.lock();
        let count = counts.slot(side);
        if *count == 0 {
            warn!(side = %side, "Close of a session that is not open ignored");
            return false;
        }
        *count -= 1;
        SESSIONS_OPEN.with_label_values(&[side.as_str()]).set(0);
        true
    }

    pub fn is_open(&self, side: Side) -> bool {
        *self.lock().slot(side) > 0
    }

    pub fn open_front_end(&self) -> Result<(), DeviceError> {
        self.open(Side::FrontEnd)
    }

    pub fn close_front_end(&self) -> bool {
        self.close(Side::FrontEnd)
    }

    pub fn open_agent(&self) -> Result<(), DeviceError> {
        self.open(Side::Agent)
    }

    pub fn close_agent(&self) -> bool {
        self.close(Side::Agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_opener_is_busy() {
        let gate = AccessGate::new();
        gate.open_front_end().unwrap();

        let err = gate.open_front_end().unwrap_err();
        assert!(matches!(err, DeviceError::Busy(Side::FrontEnd)));

        assert!(gate.close_front_end());
        gate.open_front_end().unwrap();
    }

    #[test]
    fn test_sides_are_independent() {
        let gate = AccessGate::new();
        gate.open_front_end().unwrap();
        gate.open_agent().unwrap();

        assert!(gate.is_open(Side::FrontEnd));
        assert!(gate.is_open(Side::Agent));

        gate.close_agent();
        assert!(gate.is_open(Side::FrontEnd));
        assert!(!gate.is_open(Side::Agent));
    }

    #[test]
    fn test_close_without_open_does_not_underflow() {
        let gate = AccessGate::new();
        assert!(!gate.close_agent());
        assert!(!gate.close_agent());
        assert!(!gate.is_open(Side::Agent));

        // A single open still succeeds and a second is still refused.
        gate.open_agent().unwrap();
        assert!(gate.open_agent().is_err());
    }
}
