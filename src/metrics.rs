//! Prometheus metrics for the relay
//!
//! All collectors live in the default registry. Use [`gather_text`] to render
//! them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Front end / transfer engine
    // ─────────────────────────────────────────────────────────────────────────────

    /// Completed or failed round-trips.
    ///
    /// Labels:
    /// - kind: "read" | "write"
    /// - outcome: "ok", "agent_failure", "timeout", "disconnected", "shutdown", "faulted", "protocol"
    pub static ref ROUND_TRIPS: IntCounterVec = register_int_counter_vec!(
        "usbd_round_trips_total",
        "Relay round-trips by kind and outcome",
        &["kind", "outcome"]
    ).expect("failed to register ROUND_TRIPS metric");

    /// Publish-to-answer latency of successful round-trips.
    pub static ref ROUND_TRIP_DURATION: HistogramVec = register_histogram_vec!(
        "usbd_round_trip_duration_seconds",
        "Time from publishing a chunk to observing the agent's answer",
        &["kind"],
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).expect("failed to register ROUND_TRIP_DURATION metric");

    /// Size of each chunk sent through the shared buffer.
    pub static ref CHUNK_BYTES: Histogram = register_histogram!(
        "usbd_chunk_bytes",
        "Bytes per chunk",
        vec![512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 65536.0]
    ).expect("failed to register CHUNK_BYTES metric");

    /// Bytes confirmed by the agent.
    pub static ref BYTES_TRANSFERRED: IntCounterVec = register_int_counter_vec!(
        "usbd_bytes_transferred_total",
        "Bytes moved through the relay and confirmed by the agent",
        &["kind"]
    ).expect("failed to register BYTES_TRANSFERRED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions and relay state
    // ─────────────────────────────────────────────────────────────────────────────

    /// Openers turned away because their side was already taken.
    pub static ref SESSION_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "usbd_session_rejections_total",
        "Session opens rejected as busy",
        &["side"]
    ).expect("failed to register SESSION_REJECTIONS metric");

    /// 1 while a session of the given side is open.
    pub static ref SESSIONS_OPEN: IntGaugeVec = register_int_gauge_vec!(
        "usbd_sessions_open",
        "Open sessions per side",
        &["side"]
    ).expect("failed to register SESSIONS_OPEN metric");

    /// Blocking waits cut short by an interrupt.
    pub static ref INTERRUPTED_WAITS: IntCounterVec = register_int_counter_vec!(
        "usbd_interrupted_waits_total",
        "Relay waits interrupted by an external signal",
        &["side"]
    ).expect("failed to register INTERRUPTED_WAITS metric");

    /// 0 = awaiting front-end request, 1 = awaiting agent response.
    ///
    /// Labels:
    /// - relay: owning device id
    pub static ref RELAY_PHASE: IntGaugeVec = register_int_gauge_vec!(
        "usbd_relay_phase",
        "Current relay phase (0 = front end's turn, 1 = agent's turn)",
        &["relay"]
    ).expect("failed to register RELAY_PHASE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent
    // ─────────────────────────────────────────────────────────────────────────────

    /// Requests handled by the agent runtime.
    ///
    /// Labels:
    /// - kind: "read" | "write"
    /// - outcome: "ok" | "error"
    pub static ref AGENT_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "usbd_agent_requests_total",
        "Requests served by the agent against its backend",
        &["kind", "outcome"]
    ).expect("failed to register AGENT_REQUESTS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut out = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut out) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&out).into_owned()
}
