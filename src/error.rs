//! Error types shared across the relay
//!
//! Each layer has its own enum; [`DeviceError`] is what session façades hand
//! back to their callers, and [`DeviceError::errno`] turns any of them into the
//! errno a hosting storage stack expects.

use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::device::ConfigError;
use crate::gate::Side;
use crate::relay::{Phase, Ticket, WireError};
use crate::transfer::{TransferError, TransferFailure};

/// Failures of the two-phase handshake itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// An operation was attempted while the phase belongs to the other party
    #[error("{operation} called out of turn (phase: {phase})")]
    ProtocolViolation {
        operation: &'static str,
        phase: Phase,
    },

    /// A reply or wait named a round-trip that is no longer outstanding
    #[error("ticket {presented} is stale (outstanding: {outstanding})")]
    StaleTicket { presented: Ticket, outstanding: Ticket },

    /// A blocking wait was interrupted by an external signal
    #[error("wait interrupted")]
    Interrupted,

    /// The agent did not answer within the configured bound
    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),

    /// The agent session closed while a round-trip was outstanding
    #[error("agent disconnected during round-trip")]
    AgentDisconnected,

    /// A previous round-trip timed out after the agent took it; the relay
    /// refuses new work until that agent session is gone
    #[error("relay faulted by an abandoned round-trip")]
    Faulted,

    /// The device is being torn down
    #[error("device shut down")]
    ShutDown,
}

/// Top-level error returned by device sessions
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0} session already open")]
    Busy(Side),

    #[error("range of {length} bytes at block {block_address} exceeds device size of {sectors} sectors")]
    OutOfRange {
        block_address: u64,
        length: usize,
        sectors: u64,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("malformed record: {0}")]
    Wire(#[from] WireError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DeviceError {
    /// Errno a block-layer host would complete the request with
    pub fn errno(&self) -> Errno {
        match self {
            DeviceError::Busy(_) => Errno::EBUSY,
            DeviceError::OutOfRange { .. } => Errno::ERANGE,
            DeviceError::Relay(e) => relay_errno(e),
            DeviceError::Transfer(e) => match &e.failure {
                TransferFailure::AgentFailure { .. } => Errno::EIO,
                TransferFailure::Relay(relay) => relay_errno(relay),
            },
            DeviceError::Wire(_) => Errno::EINVAL,
            DeviceError::Config(_) => Errno::EINVAL,
        }
    }

    /// Bytes moved before the failure, for errors raised mid-transfer
    pub fn bytes_transferred(&self) -> usize {
        match self {
            DeviceError::Transfer(e) => e.transferred,
            _ => 0,
        }
    }
}

fn relay_errno(error: &RelayError) -> Errno {
    match error {
        RelayError::ProtocolViolation { .. } | RelayError::StaleTicket { .. } => Errno::EPROTO,
        RelayError::Interrupted => Errno::EINTR,
        RelayError::Timeout(_) => Errno::ETIMEDOUT,
        RelayError::AgentDisconnected => Errno::ENOTCONN,
        RelayError::Faulted => Errno::EIO,
        RelayError::ShutDown => Errno::ENODEV,
    }
}
