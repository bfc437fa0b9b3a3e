//! Prometheus metrics for the wallet memory service
//!
//! Exposed on the /metrics endpoint for scraping.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Gauge, GaugeVec,
};

use crate::circuit::CircuitState;

lazy_static! {
    // Ingestion metrics
    pub static ref TRANSACTIONS_INDEXED: CounterVec = register_counter_vec!(
        "walletmem_transactions_indexed_total",
        "Transactions processed by the indexer",
        &["status"]
    ).unwrap();

    pub static ref STREAM_FRAMES: CounterVec = register_counter_vec!(
        "walletmem_stream_frames_total",
        "Inbound upstream frames by kind",
        &["kind"]
    ).unwrap();

    pub static ref STREAM_CONNECTED: Gauge = register_gauge!(
        "walletmem_stream_connected",
        "Whether the upstream stream is connected"
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_LOOKUPS: CounterVec = register_counter_vec!(
        "walletmem_cache_lookups_total",
        "Cache lookups by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref CACHE_EVICTIONS: Counter = register_counter!(
        "walletmem_cache_evictions_total",
        "Keys removed by the active eviction task"
    ).unwrap();

    // Circuit breaker metrics
    pub static ref CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        "walletmem_circuit_state",
        "Circuit state per dependency (0=closed, 1=half-open, 2=open)",
        &["dependency"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "walletmem_consecutive_failures",
        "Consecutive failures per dependency",
        &["dependency"]
    ).unwrap();

    // Event fan-out metrics
    pub static ref EVENTS_PUBLISHED: CounterVec = register_counter_vec!(
        "walletmem_events_published_total",
        "Events published to the fan-out",
        &["kind"]
    ).unwrap();

    pub static ref EVENTS_DELIVERED: Counter = register_counter!(
        "walletmem_events_delivered_total",
        "Messages delivered to subscriber sinks"
    ).unwrap();

    pub static ref EVENTS_DROPPED: Counter = register_counter!(
        "walletmem_events_dropped_total",
        "Messages dropped on subscriber buffer overflow"
    ).unwrap();

    pub static ref SUBSCRIBERS: Gauge = register_gauge!(
        "walletmem_subscribers",
        "Active fan-out subscriptions"
    ).unwrap();

    // Degradation metrics
    pub static ref WRITE_QUEUE_DEPTH: Gauge = register_gauge!(
        "walletmem_write_queue_depth",
        "Writes waiting in the degradation queue"
    ).unwrap();

    // Risk metrics
    pub static ref ANOMALIES: CounterVec = register_counter_vec!(
        "walletmem_anomalies_total",
        "Recorded anomalies by severity",
        &["severity"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "walletmem_up",
        "Whether the service is up and running"
    ).unwrap();
}

/// Record an indexed transaction ("indexed" or "duplicate")
pub fn record_transaction_indexed(status: &str) {
    TRANSACTIONS_INDEXED.with_label_values(&[status]).inc();
}

/// Record an inbound stream frame
pub fn record_stream_frame(kind: &str) {
    STREAM_FRAMES.with_label_values(&[kind]).inc();
}

/// Record upstream connection state
pub fn set_stream_connected(connected: bool) {
    STREAM_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}

/// Record a cache lookup outcome
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS.with_label_values(&[outcome]).inc();
}

/// Record keys evicted under memory pressure
pub fn record_evictions(count: u64) {
    CACHE_EVICTIONS.inc_by(count as f64);
}

/// Record a circuit state change
pub fn set_circuit_state(dependency: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    CIRCUIT_STATE.with_label_values(&[dependency]).set(value);
}

/// Update consecutive failures for a dependency
pub fn set_consecutive_failures(dependency: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[dependency])
        .set(count as f64);
}

/// Record a published event
pub fn record_event_published(kind: &str) {
    EVENTS_PUBLISHED.with_label_values(&[kind]).inc();
}

/// Record one delivered message
pub fn record_event_delivered() {
    EVENTS_DELIVERED.inc();
}

/// Record messages dropped on buffer overflow
pub fn record_events_dropped(count: u64) {
    EVENTS_DROPPED.inc_by(count as f64);
}

/// Update the active subscription count
pub fn set_subscriber_count(count: i64) {
    SUBSCRIBERS.set(count as f64);
}

/// Update the write queue depth
pub fn set_write_queue_depth(depth: i64) {
    WRITE_QUEUE_DEPTH.set(depth as f64);
}

/// Record an anomaly by severity
pub fn record_anomaly(severity: &str) {
    ANOMALIES.with_label_values(&[severity]).inc();
}
