//! Request/response record exchanged on every round-trip
//!
//! The record is the whole protocol message. The front end fills it in once
//! per chunk, the agent overwrites it once with its answer, and it travels by
//! value through the relay's single-slot mailbox.
//!
//! # Wire Layout
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────
//!   0      4    kind           (0 = read, 1 = write)
//!   4      4    padding        (always zero)
//!   8      8    length         (bytes; 0 = failure sentinel)
//!  16      8    block_address  (512-byte sectors)
//! ```
//!
//! All fields use host byte order: both parties run on the same machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoded size of a [`Record`] in bytes
pub const RECORD_SIZE: usize = 24;

/// Response length that signals a failed chunk
pub const FAILURE_LENGTH: u64 = 0;

const KIND_READ: u32 = 0;
const KIND_WRITE: u32 = 1;

/// Direction of a round-trip, fixed for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    /// Metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
        }
    }

    fn wire_value(self) -> u32 {
        match self {
            RequestKind::Read => KIND_READ,
            RequestKind::Write => KIND_WRITE,
        }
    }

    fn from_wire(value: u32) -> Result<Self, WireError> {
        match value {
            KIND_READ => Ok(RequestKind::Read),
            KIND_WRITE => Ok(RequestKind::Write),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding or encoding a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record buffer too short: need {need} bytes, got {0}", need = RECORD_SIZE)]
    Truncated(usize),
    #[error("unknown request kind {0}")]
    UnknownKind(u32),
}

/// One request (front end → agent) or response (agent → front end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RequestKind,
    /// Bytes in this chunk. In a response, bytes actually handled.
    pub length: u64,
    /// First sector of the chunk
    pub block_address: u64,
}

impl Record {
    pub fn new(kind: RequestKind, length: u64, block_address: u64) -> Self {
        Self {
            kind,
            length,
            block_address,
        }
    }

    /// Successful reply to `request`: every requested byte was handled
    pub fn completed(request: &Record) -> Self {
        *request
    }

    /// Failed reply to `request`
    pub fn failure(request: &Record) -> Self {
        Self {
            length: FAILURE_LENGTH,
            ..*request
        }
    }

    /// Reply to `request` reporting `handled` bytes
    pub fn partial(request: &Record, handled: u64) -> Self {
        Self {
            length: handled,
            ..*request
        }
    }

    /// Whether this response fully satisfies a request of `requested` bytes
    pub fn satisfies(&self, requested: u64) -> bool {
        self.length != FAILURE_LENGTH && self.length == requested
    }

    /// Write the wire form into `out`, returning the number of bytes written
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if out.len() < RECORD_SIZE {
            return Err(WireError::Truncated(out.len()));
        }
        out[0..4].copy_from_slice(&self.kind.wire_value().to_ne_bytes());
        out[4..8].fill(0);
        out[8..16].copy_from_slice(&self.length.to_ne_bytes());
        out[16..24].copy_from_slice(&self.block_address.to_ne_bytes());
        Ok(RECORD_SIZE)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        // The array is exactly RECORD_SIZE long, encoding cannot fail.
        let _ = self.encode_into(&mut out);
        out
    }

    /// Parse the wire form from the front of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < RECORD_SIZE {
            return Err(WireError::Truncated(bytes.len()));
        }
        let kind = u32::from_ne_bytes(field(bytes, 0));
        let length = u64::from_ne_bytes(field(bytes, 8));
        let block_address = u64::from_ne_bytes(field(bytes, 16));
        Ok(Self {
            kind: RequestKind::from_wire(kind)?,
            length,
            block_address,
        })
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new(RequestKind::Read, 0, 0)
    }
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
