//! Device instance - owner of everything one relay needs
//!
//! A `Device` is shared through `Arc` between the front-end collaborator and
//! the agent collaborator. The shared buffer lives exactly as long as the
//! last handle, so it can never be freed under an outstanding round-trip.
//!
//! ```text
//! ┌──────────────────────────── Device ─────────────────────────────┐
//! │  AccessGate      one front end, one agent                       │
//! │  RelayState      phase + record slot + wait queues              │
//! │  SharedBuffer    one page of staging space                      │
//! └─────────────────────────────────────────────────────────────────┘
//!        ▲                                               ▲
//!   FrontEnd (TransferEngine)                    AgentSession (ControlChannel)
//! ```

pub mod config;

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

pub use config::{ConfigError, DeviceConfig};

use crate::buffer::SharedBuffer;
use crate::channel::{AgentSession, Endpoint, FrontEnd};
use crate::error::DeviceError;
use crate::gate::{AccessGate, Side};
use crate::relay::RelayState;
use crate::transfer::TransferEngine;

/// One relay-backed block device
pub struct Device {
    id: Uuid,
    config: DeviceConfig,
    gate: AccessGate,
    relay: RelayState,
    buffer: SharedBuffer,
}

impl Device {
    /// Validate `config` and allocate the device's shared state
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>, DeviceError> {
        config.validate()?;
        let id = Uuid::now_v7();
        let device = Self {
            id,
            buffer: SharedBuffer::new(config.buffer_capacity()),
            gate: AccessGate::new(),
            relay: RelayState::with_label(id.to_string()),
            config,
        };

        info!(
            device_id = %device.id,
            sectors = device.config.sectors,
            buffer_capacity = device.buffer.capacity(),
            response_timeout_ms = ?device.config.response_timeout_ms,
            "Device created"
        );
        Ok(Arc::new(device))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn sectors(&self) -> u64 {
        self.config.sectors
    }

    pub fn size_bytes(&self) -> u64 {
        self.config.size_bytes()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn relay(&self) -> &RelayState {
        &self.relay
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Chunking engine bound to this device's relay and buffer
    ///
    /// Only reachable through a gate-holding [`FrontEnd`].
    pub(crate) fn engine(&self) -> TransferEngine<'_> {
        TransferEngine::new(&self.relay, &self.buffer, self.config.response_timeout())
    }

    /// Round-trips an operation of `total_length` bytes takes on this device
    pub fn chunk_count(&self, total_length: usize) -> usize {
        total_length.div_ceil(self.buffer.capacity())
    }

    /// Open the single front-end session
    pub fn open_front_end(self: &Arc<Self>) -> Result<FrontEnd, DeviceError> {
        FrontEnd::open(self)
    }

    /// Open the single agent session (the control channel)
    pub fn open_agent(self: &Arc<Self>) -> Result<AgentSession, DeviceError> {
        AgentSession::open(self)
    }

    /// Deliver an external signal to the waiter on `side`
    pub fn interrupt(&self, side: Side) {
        self.relay.interrupt(side);
    }

    /// Tear the relay down; every blocked or future call fails with `ShutDown`
    pub fn shutdown(&self) {
        if !self.relay.is_shut_down() {
            info!(device_id = %self.id, stats = ?self.relay.stats(), "Device shutting down");
        }
        self.relay.shutdown();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("phase", &self.relay.phase())
            .field("buffer", &self.buffer)
            .finish()
    }
}
