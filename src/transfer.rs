//! TransferEngine - streams arbitrarily large I/O through one page
//!
//! A logical read or write is cut into chunks no larger than the shared
//! buffer. Each chunk costs exactly one relay round-trip, and the next chunk
//! only starts once the previous answer is in.
//!
//! ```text
//!  write 10000 bytes @ block 10, capacity 4096
//!
//!   chunk 0: [    0 ..  4096)  block 10  ──► agent ──► ok
//!   chunk 1: [ 4096 ..  8192)  block 18  ──► agent ──► ok
//!   chunk 2: [ 8192 .. 10000)  block 26  ──► agent ──► ok
//! ```
//!
//! The first failed chunk ends the operation. The error carries how many
//! bytes made it through; remaining chunks are never attempted.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use crate::buffer::{SharedBuffer, SECTOR_SIZE};
use crate::error::RelayError;
use crate::metrics::{BYTES_TRANSFERRED, CHUNK_BYTES, ROUND_TRIPS, ROUND_TRIP_DURATION};
use crate::relay::{Record, RelayState, RequestKind, Ticket};

/// Caller-supplied data for one logical operation
#[derive(Debug)]
pub enum IoBuf<'a> {
    /// Destination of a read
    Read(&'a mut [u8]),
    /// Source of a write
    Write(&'a [u8]),
}

impl IoBuf<'_> {
    pub fn kind(&self) -> RequestKind {
        match self {
            IoBuf::Read(_) => RequestKind::Read,
            IoBuf::Write(_) => RequestKind::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IoBuf::Read(buf) => buf.len(),
            IoBuf::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a chunk failed
#[derive(Debug, Error)]
pub enum TransferFailure {
    /// The agent answered, but with the failure sentinel or a short count
    #[error("agent handled {reported} of {requested} bytes at block {block_address}")]
    AgentFailure {
        block_address: u64,
        requested: u64,
        reported: u64,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// A logical operation that stopped early
#[derive(Debug, Error)]
#[error("{kind} aborted after {transferred} bytes: {failure}")]
pub struct TransferError {
    pub kind: RequestKind,
    /// Bytes fully handled before the failing chunk
    pub transferred: usize,
    #[source]
    pub failure: TransferFailure,
}

/// Drives round-trips for one device
pub struct TransferEngine<'a> {
    relay: &'a RelayState,
    buffer: &'a SharedBuffer,
    response_timeout: Option<Duration>,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        relay: &'a RelayState,
        buffer: &'a SharedBuffer,
        response_timeout: Option<Duration>,
    ) -> Self {
        let capacity = buffer.capacity();
        assert!(
            capacity > 0 && capacity % SECTOR_SIZE == 0,
            "shared buffer capacity {capacity} is not a non-zero multiple of {SECTOR_SIZE}"
        );
        Self {
            relay,
            buffer,
            response_timeout,
        }
    }

    /// Number of round-trips an operation of `total_length` bytes takes
    pub fn chunk_count(&self, total_length: usize) -> usize {
        total_length.div_ceil(self.buffer.capacity())
    }

    pub fn read(&self, start_block: u64, dst: &mut [u8]) -> Result<usize, TransferError> {
        self.execute(start_block, IoBuf::Read(dst))
    }

    pub fn write(&self, start_block: u64, src: &[u8]) -> Result<usize, TransferError> {
        self.execute(start_block, IoBuf::Write(src))
    }

    /// Run one logical operation, returning the bytes transferred
    pub fn execute(&self, start_block: u64, mut data: IoBuf<'_>) -> Result<usize, TransferError> {
        let kind = data.kind();
        let total = data.len();
        if total == 0 {
            return Ok(0);
        }

        let trace_id = Uuid::now_v7();
        let span = info_span!(
            "transfer",
            trace_id = %trace_id,
            kind = %kind,
            start_block,
            total,
            chunks = self.chunk_count(total)
        );
        let _entered = span.enter();
        let _operation = self.relay.begin_operation();

        let capacity = self.buffer.capacity();
        let mut block_address = start_block;
        let mut done = 0usize;

        while done < total {
            let chunk_len = (total - done).min(capacity);
            let range = done..done + chunk_len;

            let request = Record::new(kind, chunk_len as u64, block_address);
            let staged = match &data {
                IoBuf::Write(src) => Some(&src[range.clone()]),
                IoBuf::Read(_) => None,
            };
            let response = self
                .round_trip(request, staged)
                .map_err(|failure| TransferError {
                    kind,
                    transferred: done,
                    failure,
                })?;

            if !response.satisfies(request.length) {
                warn!(
                    block_address,
                    requested = request.length,
                    reported = response.length,
                    transferred = done,
                    "Agent reported failure, aborting transfer"
                );
                ROUND_TRIPS.with_label_values(&[kind.as_str(), "agent_failure"]).inc();
                return Err(TransferError {
                    kind,
                    transferred: done,
                    failure: TransferFailure::AgentFailure {
                        block_address,
                        requested: request.length,
                        reported: response.length,
                    },
                });
            }

            if let IoBuf::Read(dst) = &mut data {
                self.buffer.unstage(&mut dst[range]);
            }

            ROUND_TRIPS.with_label_values(&[kind.as_str(), "ok"]).inc();
            BYTES_TRANSFERRED
                .with_label_values(&[kind.as_str()])
                .inc_by(chunk_len as u64);
            debug!(block_address, chunk_len, "Chunk complete");

            done += chunk_len;
            block_address += (chunk_len / SECTOR_SIZE) as u64;
        }

        Ok(done)
    }

    /// Publish one chunk, staging `staged` first, and wait for its answer
    fn round_trip(&self, request: Record, staged: Option<&[u8]>) -> Result<Record, TransferFailure> {
        let started = Instant::now();
        CHUNK_BYTES.observe(request.length as f64);

        let stage = || {
            if let Some(src) = staged {
                self.buffer.stage(src);
            }
        };
        let ticket = self.relay.publish_request_with(request, stage).inspect_err(|e| {
            ROUND_TRIPS
                .with_label_values(&[request.kind.as_str(), outcome_label(e)])
                .inc();
        })?;

        let response = self.await_response(ticket, started).inspect_err(|e| {
            ROUND_TRIPS
                .with_label_values(&[request.kind.as_str(), outcome_label(e)])
                .inc();
        })?;

        ROUND_TRIP_DURATION
            .with_label_values(&[request.kind.as_str()])
            .observe(started.elapsed().as_secs_f64());
        Ok(response)
    }

    /// Wait for `ticket`, re-entering the wait when interrupted
    fn await_response(&self, ticket: Ticket, started: Instant) -> Result<Record, RelayError> {
        let deadline = self.response_timeout.map(|timeout| started + timeout);
        loop {
            match self.relay.await_agent_response(ticket, deadline) {
                Err(RelayError::Interrupted) => {
                    debug!(ticket = %ticket, "Wait interrupted, waiting again");
                }
                other => return other,
            }
        }
    }
}

fn outcome_label(error: &RelayError) -> &'static str {
    match error {
        RelayError::Timeout(_) => "timeout",
        RelayError::AgentDisconnected => "disconnected",
        RelayError::ShutDown => "shutdown",
        RelayError::Faulted => "faulted",
        RelayError::Interrupted => "interrupted",
        RelayError::ProtocolViolation { .. } | RelayError::StaleTicket { .. } => "protocol",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Answers every request with `reply(index, request)` until `count` are served
    fn scripted_agent(
        relay: Arc<RelayState>,
        buffer: Arc<SharedBuffer>,
        count: usize,
        reply: impl Fn(usize, &Record) -> Record + Send + 'static,
    ) -> thread::JoinHandle<Vec<Record>> {
        thread::spawn(move || {
            let mut seen = Vec::new();
            for index in 0..count {
                let delivery = match relay.await_request() {
                    Ok(delivery) => delivery,
                    Err(_) => break,
                };
                if delivery.record.kind == RequestKind::Read {
                    let len = delivery.record.length as usize;
                    buffer.with_mut(|region| region[..len].fill(index as u8 + 1));
                }
                seen.push(delivery.record);
                let answer = reply(index, &delivery.record);
                relay.publish_response(delivery.ticket, answer).unwrap();
            }
            seen
        })
    }

    fn setup(capacity: usize) -> (Arc<RelayState>, Arc<SharedBuffer>) {
        (
            Arc::new(RelayState::new()),
            Arc::new(SharedBuffer::new(capacity)),
        )
    }

    #[test]
    fn test_zero_length_is_noop() {
        let (relay, buffer) = setup(4096);
        let engine = TransferEngine::new(&relay, &buffer, None);

        assert_eq!(engine.write(0, &[]).unwrap(), 0);
        assert_eq!(relay.stats().requests, 0);
    }

    #[test]
    #[should_panic(expected = "is not a non-zero multiple of 512")]
    fn test_unaligned_capacity_rejected() {
        let (relay, buffer) = setup(1000);
        TransferEngine::new(&relay, &buffer, None);
    }

    #[test]
    fn test_chunk_count() {
        let (relay, buffer) = setup(4096);
        let engine = TransferEngine::new(&relay, &buffer, None);
        assert_eq!(engine.chunk_count(1), 1);
        assert_eq!(engine.chunk_count(4096), 1);
        assert_eq!(engine.chunk_count(4097), 2);
        assert_eq!(engine.chunk_count(10000), 3);
    }

    #[test]
    fn test_write_chunks_and_block_addresses() {
        let (relay, buffer) = setup(4096);
        let agent = scripted_agent(relay.clone(), buffer.clone(), 3, |_, r| Record::completed(r));

        let engine = TransferEngine::new(&relay, &buffer, None);
        let data = vec![0xABu8; 10000];
        assert_eq!(engine.write(10, &data).unwrap(), 10000);

        let seen = agent.join().unwrap();
        let lengths: Vec<u64> = seen.iter().map(|r| r.length).collect();
        let blocks: Vec<u64> = seen.iter().map(|r| r.block_address).collect();
        assert_eq!(lengths, vec![4096, 4096, 1808]);
        assert_eq!(blocks, vec![10, 18, 26]);
        assert!(seen.iter().all(|r| r.kind == RequestKind::Write));
    }

    #[test]
    fn test_read_copies_each_chunk_out() {
        let (relay, buffer) = setup(1024);
        let agent = scripted_agent(relay.clone(), buffer.clone(), 3, |_, r| Record::completed(r));

        let engine = TransferEngine::new(&relay, &buffer, None);
        let mut out = vec![0u8; 2500];
        assert_eq!(engine.read(0, &mut out).unwrap(), 2500);
        agent.join().unwrap();

        assert!(out[..1024].iter().all(|&b| b == 1));
        assert!(out[1024..2048].iter().all(|&b| b == 2));
        assert!(out[2048..].iter().all(|&b| b == 3));
    }

    #[test]
    fn test_agent_failure_short_circuits() {
        let (relay, buffer) = setup(4096);
        let agent = scripted_agent(relay.clone(), buffer.clone(), 3, |index, r| {
            if index == 1 {
                Record::failure(r)
            } else {
                Record::completed(r)
            }
        });

        let engine = TransferEngine::new(&relay, &buffer, None);
        let err = engine.write(0, &vec![1u8; 10000]).unwrap_err();
        relay.shutdown();

        assert_eq!(err.transferred, 4096);
        assert!(matches!(
            err.failure,
            TransferFailure::AgentFailure { block_address: 8, requested: 4096, reported: 0 }
        ));
        // The third chunk was never published.
        assert_eq!(agent.join().unwrap().len(), 2);
        assert_eq!(relay.stats().requests, 2);
    }

    #[test]
    fn test_short_read_is_failure() {
        let (relay, buffer) = setup(4096);
        let agent = scripted_agent(relay.clone(), buffer.clone(), 1, |_, r| Record::partial(r, 100));

        let engine = TransferEngine::new(&relay, &buffer, None);
        let mut out = vec![0u8; 512];
        let err = engine.read(4, &mut out).unwrap_err();
        agent.join().unwrap();

        assert_eq!(err.transferred, 0);
        assert_eq!(err.kind, RequestKind::Read);
        // Nothing was copied out of the buffer for the failed chunk.
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_interrupted_wait_is_retried() {
        let (relay, buffer) = setup(4096);
        let interrupted = Arc::new(Mutex::new(false));

        let agent = {
            let relay = relay.clone();
            let interrupted = interrupted.clone();
            thread::spawn(move || {
                let delivery = relay.await_request().unwrap();
                relay.interrupt(crate::gate::Side::FrontEnd);
                *interrupted.lock().unwrap() = true;
                thread::sleep(Duration::from_millis(20));
                relay
                    .publish_response(delivery.ticket, Record::completed(&delivery.record))
                    .unwrap();
            })
        };

        let engine = TransferEngine::new(&relay, &buffer, None);
        assert_eq!(engine.write(0, &[5u8; 512]).unwrap(), 512);
        agent.join().unwrap();
        assert!(*interrupted.lock().unwrap());
    }

    #[test]
    fn test_timeout_reports_partial_progress() {
        let (relay, buffer) = setup(512);
        let agent = scripted_agent(relay.clone(), buffer.clone(), 1, |_, r| Record::completed(r));

        let engine = TransferEngine::new(&relay, &buffer, Some(Duration::from_millis(30)));
        let err = engine.write(0, &[0u8; 1024]).unwrap_err();
        agent.join().unwrap();

        assert_eq!(err.transferred, 512);
        assert!(matches!(
            err.failure,
            TransferFailure::Relay(RelayError::Timeout(_))
        ));
    }
}
