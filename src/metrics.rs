//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on the /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, Gauge, GaugeVec, HistogramVec, IntCounterVec, IntGauge,
};

lazy_static! {
    // Block scanning metrics
    pub static ref BLOCKS_SCANNED: IntCounterVec = register_int_counter_vec!(
        "relayer_blocks_scanned_total",
        "Total number of blocks scanned by chain watchers",
        &["chain"]
    ).unwrap();

    pub static ref LAST_SCANNED_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_last_scanned_block",
        "Last block number whose events were dispatched",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "relayer_events_dispatched_total",
        "Bridge events handed from a watcher to the relay engine",
        &["direction"]
    ).unwrap();

    // Relay outcomes
    pub static ref RELAY_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "relayer_relay_outcomes_total",
        "Relay attempts by direction and outcome",
        &["direction", "outcome"]
    ).unwrap();

    pub static ref PROCESSING_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_processing_latency_seconds",
        "Time from verification start to confirmed destination transaction",
        &["direction"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref STUCK_RECORDS: IntGauge = register_int_gauge!(
        "relayer_stuck_records",
        "Records marked processed whose destination call needs manual reconciliation"
    ).unwrap();

    // RPC health
    pub static ref RPC_ERRORS: IntCounterVec = register_int_counter_vec!(
        "relayer_rpc_errors_total",
        "RPC errors by chain and failure class",
        &["chain", "kind"]
    ).unwrap();

    pub static ref RPC_ROTATIONS: IntCounterVec = register_int_counter_vec!(
        "relayer_rpc_rotations_total",
        "RPC endpoint rotations",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

/// Record a block whose events were dispatched
pub fn record_block_scanned(chain: &str, block_number: u64) {
    BLOCKS_SCANNED.with_label_values(&[chain]).inc();
    LAST_SCANNED_BLOCK
        .with_label_values(&[chain])
        .set(block_number as f64);
}

/// Record an event handed to the relay engine
pub fn record_event_dispatched(direction: &str) {
    EVENTS_DISPATCHED.with_label_values(&[direction]).inc();
}

/// Record the outcome of one relay attempt
pub fn record_relay_outcome(direction: &str, outcome: &str) {
    RELAY_OUTCOMES.with_label_values(&[direction, outcome]).inc();
}

/// Record processing latency
pub fn record_latency(direction: &str, seconds: f64) {
    PROCESSING_LATENCY
        .with_label_values(&[direction])
        .observe(seconds);
}

/// Update the stuck record count
pub fn set_stuck_records(count: usize) {
    STUCK_RECORDS.set(count as i64);
}
