//! RelayState - the two-phase handshake between front end and agent
//!
//! Exactly one round-trip is ever outstanding. `phase` says whose turn it is,
//! and whoever owns the turn also owns the shared buffer and the record slot.
//!
//! ```text
//!   front end                         agent
//!   ─────────                         ─────
//!   publish_request ──► AwaitingAgentResponse ──► await_request
//!          │                                           │
//!   await_agent_response                         (does the I/O)
//!          │                                           │
//!          ◄──── AwaitingFrontEndRequest ◄──── publish_response
//! ```
//!
//! Every transition happens under one mutex together with its wake-up, so a
//! waiter re-checking the phase always sees the value that woke it. Each side
//! sleeps on its own condition variable.
//!
//! A second mutex, the operation lock, serializes whole front-end operations.
//! Only its holder stages data or publishes requests.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use prometheus::IntGauge;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::record::Record;
use crate::error::RelayError;
use crate::gate::Side;
use crate::metrics::{INTERRUPTED_WAITS, RELAY_PHASE};

/// Whose turn it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// The front end may publish the next request
    AwaitingFrontEndRequest,
    /// A request is outstanding; the agent owns the buffer
    AwaitingAgentResponse,
}

impl Phase {
    fn gauge_value(self) -> i64 {
        match self {
            Phase::AwaitingFrontEndRequest => 0,
            Phase::AwaitingAgentResponse => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::AwaitingFrontEndRequest => f.write_str("awaiting front-end request"),
            Phase::AwaitingAgentResponse => f.write_str("awaiting agent response"),
        }
    }
}

/// Identifies one published request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub ticket: Ticket,
    pub record: Record,
}

/// Transition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Transitions into `AwaitingAgentResponse`
    pub requests: u64,
    /// Transitions back into `AwaitingFrontEndRequest` by an agent reply
    pub responses: u64,
}

struct Slot {
    phase: Phase,
    record: Record,
    /// Latest issued ticket; 0 before the first request
    ticket: u64,
    /// The agent has picked up the outstanding request
    delivered: bool,
    /// Ticket failed because the agent went away
    aborted: Option<u64>,
    faulted: bool,
    front_end_interrupt: bool,
    agent_interrupt: bool,
    shutdown: bool,
    stats: RelayStats,
}

impl Slot {
    fn set_phase(&mut self, phase: Phase, gauge: &IntGauge) {
        self.phase = phase;
        gauge.set(phase.gauge_value());
    }

    fn outstanding(&self) -> Ticket {
        Ticket(self.ticket)
    }
}

/// Singleton handshake for one device instance
pub struct RelayState {
    slot: Mutex<Slot>,
    front_end: Condvar,
    agent: Condvar,
    operation: Mutex<()>,
    label: String,
    phase_gauge: IntGauge,
}

impl RelayState {
    pub fn new() -> Self {
        Self::with_label(Uuid::now_v7().to_string())
    }

    /// Relay whose phase gauge is labelled `label` (the owning device's id)
    pub fn with_label(label: impl Into<String>) -> Self {
        let label = label.into();
        let phase_gauge = RELAY_PHASE.with_label_values(&[label.as_str()]);
        phase_gauge.set(Phase::AwaitingFrontEndRequest.gauge_value());
        Self {
            slot: Mutex::new(Slot {
                phase: Phase::AwaitingFrontEndRequest,
                record: Record::default(),
                ticket: 0,
                delivered: false,
                aborted: None,
                faulted: false,
                front_end_interrupt: false,
                agent_interrupt: false,
                shutdown: false,
                stats: RelayStats::default(),
            }),
            front_end: Condvar::new(),
            agent: Condvar::new(),
            operation: Mutex::new(()),
            label,
            phase_gauge,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn stats(&self) -> RelayStats {
        self.lock().stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Front end: claim the right to run one logical operation
    ///
    /// Blocks while another operation holds it. Everything between staging
    /// the first chunk and consuming the last answer happens under the guard.
    pub fn begin_operation(&self) -> MutexGuard<'_, ()> {
        self.operation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Front end: hand `record` to the agent and flip the turn
    pub fn publish_request(&self, record: Record) -> Result<Ticket, RelayError> {
        self.publish_request_with(record, || {})
    }

    /// Like [`publish_request`](Self::publish_request), running `stage` first
    ///
    /// `stage` runs under the relay lock and only once the request is
    /// accepted, so nothing is copied into a buffer a faulted agent still owns.
    pub fn publish_request_with(
        &self,
        record: Record,
        stage: impl FnOnce(),
    ) -> Result<Ticket, RelayError> {
        let mut slot = self.lock();
        if slot.shutdown {
            return Err(RelayError::ShutDown);
        }
        if slot.faulted {
            return Err(RelayError::Faulted);
        }
        if slot.phase != Phase::AwaitingFrontEndRequest {
            return Err(RelayError::ProtocolViolation {
                operation: "publish_request",
                phase: slot.phase,
            });
        }

        stage();
        slot.ticket += 1;
        slot.record = record;
        slot.delivered = false;
        slot.aborted = None;
        slot.stats.requests += 1;
        slot.set_phase(Phase::AwaitingAgentResponse, &self.phase_gauge);
        self.agent.notify_all();

        Ok(slot.outstanding())
    }

    /// Front end: block until the agent answers `ticket`
    ///
    /// With a `deadline`, a wait that runs out abandons the round-trip. If the
    /// agent had already taken the request the relay is faulted, since the
    /// agent may still be touching the shared buffer.
    pub fn await_agent_response(
        &self,
        ticket: Ticket,
        deadline: Option<Instant>,
    ) -> Result<Record, RelayError> {
        let started = Instant::now();
        let mut slot = self.lock();
        loop {
            if slot.aborted == Some(ticket.0) {
                slot.aborted = None;
                return Err(RelayError::AgentDisconnected);
            }
            if slot.ticket != ticket.0 {
                return Err(RelayError::StaleTicket {
                    presented: ticket,
                    outstanding: slot.outstanding(),
                });
            }
            if slot.phase == Phase::AwaitingFrontEndRequest {
                if slot.faulted {
                    return Err(RelayError::Faulted);
                }
                return Ok(slot.record);
            }
            if slot.shutdown {
                return Err(RelayError::ShutDown);
            }
            if slot.front_end_interrupt {
                slot.front_end_interrupt = false;
                INTERRUPTED_WAITS.with_label_values(&[Side::FrontEnd.as_str()]).inc();
                return Err(RelayError::Interrupted);
            }

            slot = match deadline {
                None => self
                    .front_end
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = now.duration_since(started);
                        if slot.delivered {
                            slot.faulted = true;
                        }
                        warn!(
                            ticket = %ticket,
                            delivered = slot.delivered,
                            waited_ms = waited.as_millis() as u64,
                            "Abandoning round-trip after timeout"
                        );
                        slot.delivered = false;
                        slot.set_phase(Phase::AwaitingFrontEndRequest, &self.phase_gauge);
                        self.agent.notify_all();
                        return Err(RelayError::Timeout(waited));
                    }
                    self.front_end
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Agent: block until a request is outstanding
    ///
    /// Calling again before replying returns the same delivery.
    pub fn await_request(&self) -> Result<Delivery, RelayError> {
        let mut slot = self.lock();
        loop {
            if slot.shutdown {
                return Err(RelayError::ShutDown);
            }
            if slot.faulted {
                return Err(RelayError::Faulted);
            }
            if slot.phase == Phase::AwaitingAgentResponse {
                slot.delivered = true;
                return Ok(Delivery {
                    ticket: slot.outstanding(),
                    record: slot.record,
                });
            }
            if slot.agent_interrupt {
                slot.agent_interrupt = false;
                INTERRUPTED_WAITS.with_label_values(&[Side::Agent.as_str()]).inc();
                return Err(RelayError::Interrupted);
            }
            slot = self
                .agent
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Agent: answer `ticket` with `record` and hand the turn back
    pub fn publish_response(&self, ticket: Ticket, record: Record) -> Result<(), RelayError> {
        let mut slot = self.lock();
        if slot.shutdown {
            return Err(RelayError::ShutDown);
        }
        if slot.faulted {
            return Err(RelayError::Faulted);
        }
        if slot.phase != Phase::AwaitingAgentResponse {
            return Err(RelayError::ProtocolViolation {
                operation: "publish_response",
                phase: slot.phase,
            });
        }
        if slot.ticket != ticket.0 {
            return Err(RelayError::StaleTicket {
                presented: ticket,
                outstanding: slot.outstanding(),
            });
        }

        slot.record = record;
        slot.delivered = false;
        slot.stats.responses += 1;
        slot.set_phase(Phase::AwaitingFrontEndRequest, &self.phase_gauge);
        self.front_end.notify_all();
        Ok(())
    }

    /// A new agent session is starting
    pub fn attach_agent(&self) {
        let mut slot = self.lock();
        slot.agent_interrupt = false;
        slot.faulted = false;
    }

    /// The agent session ended; an outstanding round-trip fails
    pub fn detach_agent(&self) {
        let mut slot = self.lock();
        if slot.phase == Phase::AwaitingAgentResponse {
            debug!(ticket = %slot.outstanding(), "Failing round-trip of departing agent");
            slot.aborted = Some(slot.ticket);
            slot.delivered = false;
            slot.set_phase(Phase::AwaitingFrontEndRequest, &self.phase_gauge);
            self.front_end.notify_all();
        }
        slot.faulted = false;
        slot.agent_interrupt = false;
    }

    /// Deliver an external signal to whichever party `side` names
    pub fn interrupt(&self, side: Side) {
        let mut slot = self.lock();
        match side {
            Side::FrontEnd => {
                slot.front_end_interrupt = true;
                self.front_end.notify_all();
            }
            Side::Agent => {
                slot.agent_interrupt = true;
                self.agent.notify_all();
            }
        }
    }

    /// Device teardown: release every waiter for good
    pub fn shutdown(&self) {
        let mut slot = self.lock();
        slot.shutdown = true;
        self.front_end.notify_all();
        self.agent.notify_all();
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayState {
    fn drop(&mut self) {
        let _ = RELAY_PHASE.remove_label_values(&[self.label.as_str()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RequestKind;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn write_request(block: u64) -> Record {
        Record::new(RequestKind::Write, 512, block)
    }

    #[test]
    fn test_initial_phase() {
        let relay = RelayState::new();
        assert_eq!(relay.phase(), Phase::AwaitingFrontEndRequest);
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[test]
    fn test_single_round_trip() {
        let relay = RelayState::new();

        let ticket = relay.publish_request(write_request(3)).unwrap();
        assert_eq!(relay.phase(), Phase::AwaitingAgentResponse);

        let delivery = relay.await_request().unwrap();
        assert_eq!(delivery.ticket, ticket);
        assert_eq!(delivery.record.block_address, 3);

        relay
            .publish_response(ticket, Record::completed(&delivery.record))
            .unwrap();
        assert_eq!(relay.phase(), Phase::AwaitingFrontEndRequest);

        let response = relay.await_agent_response(ticket, None).unwrap();
        assert_eq!(response.length, 512);
    }

    #[test]
    fn test_out_of_turn_calls_rejected() {
        let relay = RelayState::new();
        let err = relay
            .publish_response(Ticket(0), Record::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation { operation: "publish_response", .. }));

        relay.publish_request(write_request(0)).unwrap();
        let err = relay.publish_request(write_request(1)).unwrap_err();
        assert_eq!(
            err,
            RelayError::ProtocolViolation {
                operation: "publish_request",
                phase: Phase::AwaitingAgentResponse,
            }
        );
    }

    #[test]
    fn test_stale_ticket_rejected() {
        let relay = RelayState::new();
        let first = relay.publish_request(write_request(0)).unwrap();
        relay.publish_response(first, Record::completed(&write_request(0))).unwrap();

        let second = relay.publish_request(write_request(1)).unwrap();
        let err = relay.publish_response(first, Record::default()).unwrap_err();
        assert_eq!(
            err,
            RelayError::StaleTicket {
                presented: first,
                outstanding: second,
            }
        );
    }

    #[test]
    fn test_blocking_handoff_between_threads() {
        let relay = Arc::new(RelayState::new());

        let agent = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                let delivery = relay.await_request().unwrap();
                relay
                    .publish_response(delivery.ticket, Record::completed(&delivery.record))
                    .unwrap();
                delivery.record
            })
        };

        let ticket = relay.publish_request(write_request(42)).unwrap();
        let response = relay.await_agent_response(ticket, None).unwrap();

        assert_eq!(agent.join().unwrap().block_address, 42);
        assert_eq!(response.block_address, 42);
        assert_eq!(relay.stats(), RelayStats { requests: 1, responses: 1 });
    }

    #[test]
    fn test_interrupt_wakes_front_end() {
        let relay = Arc::new(RelayState::new());
        let ticket = relay.publish_request(write_request(0)).unwrap();

        let signaller = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                relay.interrupt(Side::FrontEnd);
            })
        };

        let err = relay.await_agent_response(ticket, None).unwrap_err();
        signaller.join().unwrap();
        assert_eq!(err, RelayError::Interrupted);
        // Interruption leaves the round-trip outstanding.
        assert_eq!(relay.phase(), Phase::AwaitingAgentResponse);
    }

    #[test]
    fn test_timeout_before_delivery_does_not_fault() {
        let relay = RelayState::new();
        let ticket = relay.publish_request(write_request(0)).unwrap();

        let deadline = Instant::now() + Duration::from_millis(10);
        let err = relay.await_agent_response(ticket, Some(deadline)).unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
        assert_eq!(relay.phase(), Phase::AwaitingFrontEndRequest);

        // Nobody touched the buffer, so the next request goes through.
        relay.publish_request(write_request(1)).unwrap();
    }

    #[test]
    fn test_timeout_after_delivery_faults_until_detach() {
        let relay = RelayState::new();
        let ticket = relay.publish_request(write_request(0)).unwrap();
        let delivery = relay.await_request().unwrap();

        let deadline = Instant::now() + Duration::from_millis(10);
        let err = relay.await_agent_response(ticket, Some(deadline)).unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));

        assert_eq!(relay.publish_request(write_request(1)), Err(RelayError::Faulted));
        assert_eq!(
            relay.publish_response(delivery.ticket, Record::completed(&delivery.record)),
            Err(RelayError::Faulted)
        );
        assert_eq!(relay.await_request(), Err(RelayError::Faulted));

        relay.detach_agent();
        relay.publish_request(write_request(1)).unwrap();
    }

    #[test]
    fn test_detach_fails_outstanding_round_trip() {
        let relay = Arc::new(RelayState::new());
        let ticket = relay.publish_request(write_request(9)).unwrap();
        relay.await_request().unwrap();

        let agent = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                relay.detach_agent();
            })
        };

        let err = relay.await_agent_response(ticket, None).unwrap_err();
        agent.join().unwrap();
        assert_eq!(err, RelayError::AgentDisconnected);
        assert_eq!(relay.phase(), Phase::AwaitingFrontEndRequest);
    }

    #[test]
    fn test_shutdown_releases_agent() {
        let relay = Arc::new(RelayState::new());
        let agent = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || relay.await_request())
        };

        thread::sleep(Duration::from_millis(20));
        relay.shutdown();

        assert_eq!(agent.join().unwrap(), Err(RelayError::ShutDown));
        assert_eq!(relay.publish_request(write_request(0)), Err(RelayError::ShutDown));
        assert!(relay.is_shut_down());
    }

    #[test]
    fn test_faulted_relay_does_not_stage() {
        let relay = RelayState::new();
        let ticket = relay.publish_request(write_request(0)).unwrap();
        relay.await_request().unwrap();
        let deadline = Instant::now() + Duration::from_millis(10);
        relay.await_agent_response(ticket, Some(deadline)).unwrap_err();

        let mut staged = false;
        let err = relay
            .publish_request_with(write_request(1), || staged = true)
            .unwrap_err();
        assert_eq!(err, RelayError::Faulted);
        assert!(!staged);

        relay.shutdown();
        let err = relay
            .publish_request_with(write_request(1), || staged = true)
            .unwrap_err();
        assert_eq!(err, RelayError::ShutDown);
        assert!(!staged);
    }

    #[test]
    fn test_operation_lock_serializes_front_ends() {
        let relay = Arc::new(RelayState::new());
        let guard = relay.begin_operation();

        let contender = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                let _guard = relay.begin_operation();
                relay.publish_request(write_request(5)).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(20));
        // The contender is parked on the operation lock, not racing the slot.
        assert_eq!(relay.stats().requests, 0);
        drop(guard);

        contender.join().unwrap();
        assert_eq!(relay.stats().requests, 1);
    }

    #[test]
    fn test_phase_gauge_is_per_relay() {
        let busy = RelayState::with_label("relay-busy");
        let idle = RelayState::with_label("relay-idle");
        busy.publish_request(write_request(0)).unwrap();

        let gauge = |label: &str| RELAY_PHASE.with_label_values(&[label]).get();
        assert_eq!(gauge(busy.label()), 1);
        assert_eq!(gauge(idle.label()), 0);
    }
}
