//! Agent session: the control channel
//!
//! The agent learns about the next chunk through [`AgentSession::receive_next`],
//! does the real I/O directly on the shared buffer returned by
//! [`AgentSession::map`], and reports the outcome with [`AgentSession::reply`].

use std::sync::Arc;

use tracing::{debug, info};

use super::Endpoint;
use crate::buffer::SharedBuffer;
use crate::device::Device;
use crate::error::{DeviceError, RelayError};
use crate::gate::Side;
use crate::relay::{Delivery, Record, RECORD_SIZE};

/// The single open agent
///
/// Dropping the session while a request is outstanding fails that request on
/// the front end with `AgentDisconnected`.
pub struct AgentSession {
    device: Arc<Device>,
    pending: Option<Delivery>,
}

impl AgentSession {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Block until the front end publishes a request, and return it
    pub fn receive_next(&mut self) -> Result<Record, DeviceError> {
        let delivery = self.device.relay().await_request()?;
        debug!(
            ticket = %delivery.ticket,
            kind = %delivery.record.kind,
            length = delivery.record.length,
            block_address = delivery.record.block_address,
            "Request received"
        );
        self.pending = Some(delivery);
        Ok(delivery.record)
    }

    /// Answer the request last returned by `receive_next`
    ///
    /// The request stays pending if the relay refuses the reply.
    pub fn reply(&mut self, record: Record) -> Result<(), DeviceError> {
        let delivery = self.pending.ok_or(RelayError::ProtocolViolation {
            operation: "reply",
            phase: self.device.relay().phase(),
        })?;
        self.device.relay().publish_response(delivery.ticket, record)?;
        self.pending = None;
        Ok(())
    }

    /// Request currently awaiting a reply, if any
    pub fn pending(&self) -> Option<Record> {
        self.pending.map(|delivery| delivery.record)
    }

    /// The shared buffer the current request's data lives in
    pub fn map(&self) -> &SharedBuffer {
        self.device.buffer()
    }
}

impl Endpoint for AgentSession {
    const SIDE: Side = Side::Agent;

    fn open(device: &Arc<Device>) -> Result<Self, DeviceError> {
        device.gate().open(Self::SIDE)?;
        device.relay().attach_agent();
        info!(device_id = %device.id(), "Agent attached");
        Ok(Self {
            device: Arc::clone(device),
            pending: None,
        })
    }

    /// Blocking receive; encodes the next request record into `buf`
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if buf.len() < RECORD_SIZE {
            return Err(crate::relay::WireError::Truncated(buf.len()).into());
        }
        let record = self.receive_next()?;
        Ok(record.encode_into(buf)?)
    }

    /// Decodes a response record from `buf` and replies with it
    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let record = Record::decode(buf)?;
        self.reply(record)?;
        Ok(RECORD_SIZE)
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("device_id", &self.device.id())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.device.relay().detach_agent();
        self.device.gate().close(Self::SIDE);
        info!(device_id = %self.device.id(), "Agent detached");
    }
}
