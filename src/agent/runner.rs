//! Agent loop - serves relay requests against a backend
//!
//! ```text
//! open session ─► loop {
//!                   receive_next()        (blocks)
//!                   read/write backend ◄─► shared buffer
//!                   reply(length | 0)
//!                 } ─► flush ─► close session
//! ```
//!
//! Backend errors are answered with the failure sentinel; the loop keeps
//! serving. It ends on device shutdown or when its [`StopHandle`] fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::Backend;
use crate::buffer::{SharedBuffer, SECTOR_SIZE};
use crate::channel::AgentSession;
use crate::device::Device;
use crate::error::{DeviceError, RelayError};
use crate::gate::Side;
use crate::metrics::AGENT_REQUESTS;
use crate::relay::{Record, RequestKind};

/// Counters for one agent run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub reads: u64,
    pub writes: u64,
    pub failures: u64,
    pub bytes: u64,
}

/// Asks a running agent loop to return
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    device: Arc<Device>,
}

impl StopHandle {
    /// Set the stop flag and wake the agent if it is blocked waiting
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.device.interrupt(Side::Agent);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drives one agent session against `B`
pub struct AgentRunner<B: Backend> {
    backend: B,
    stop: Arc<AtomicBool>,
    stats: AgentStats,
}

impl<B: Backend> AgentRunner<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            stop: Arc::new(AtomicBool::new(false)),
            stats: AgentStats::default(),
        }
    }

    /// Handle for stopping this runner from another thread
    pub fn stop_handle(&self, device: &Arc<Device>) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
            device: Arc::clone(device),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Serve requests until shutdown or stop
    pub fn run(&mut self, session: &mut AgentSession) -> Result<AgentStats, DeviceError> {
        let device_id = session.device().id();
        info!(device_id = %device_id, backend_bytes = self.backend.len(), "Agent loop starting");

        let outcome = self.serve_until_done(session);

        if let Err(e) = self.backend.flush() {
            warn!(error = %e, "Backend flush failed");
        }
        info!(device_id = %device_id, stats = ?self.stats, "Agent loop finished");
        outcome.map(|_| self.stats)
    }

    fn serve_until_done(&mut self, session: &mut AgentSession) -> Result<(), DeviceError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            let request = match session.receive_next() {
                Ok(request) => request,
                Err(DeviceError::Relay(RelayError::Interrupted)) => continue,
                Err(DeviceError::Relay(RelayError::ShutDown)) => return Ok(()),
                Err(e) => return Err(e),
            };

            let response = self.serve(session.map(), &request);
            match session.reply(response) {
                Ok(()) => {}
                Err(DeviceError::Relay(RelayError::ShutDown)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Perform one request between the backend and the shared buffer
    fn serve(&mut self, buffer: &SharedBuffer, request: &Record) -> Record {
        let started = Instant::now();
        let length = request.length as usize;
        let offset = request.block_address.saturating_mul(SECTOR_SIZE as u64);

        let result = if length == 0 || length > buffer.capacity() {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("chunk length {} outside 1..={}", length, buffer.capacity()),
            ))
        } else {
            let backend = &mut self.backend;
            match request.kind {
                RequestKind::Read => {
                    buffer.with_mut(|region| backend.read_at(offset, &mut region[..length]))
                }
                RequestKind::Write => {
                    buffer.with(|region| backend.write_at(offset, &region[..length]))
                }
            }
        };

        match request.kind {
            RequestKind::Read => self.stats.reads += 1,
            RequestKind::Write => self.stats.writes += 1,
        }

        match result {
            Ok(()) => {
                self.stats.bytes += request.length;
                AGENT_REQUESTS.with_label_values(&[request.kind.as_str(), "ok"]).inc();
                debug!(
                    kind = %request.kind,
                    block_address = request.block_address,
                    length,
                    duration_us = started.elapsed().as_micros() as u64,
                    "Request served"
                );
                Record::completed(request)
            }
            Err(e) => {
                self.stats.failures += 1;
                AGENT_REQUESTS.with_label_values(&[request.kind.as_str(), "error"]).inc();
                warn!(
                    kind = %request.kind,
                    block_address = request.block_address,
                    length,
                    error = %e,
                    "Backend I/O failed, replying with failure"
                );
                Record::failure(request)
            }
        }
    }
}
