//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention `bus_<metric>_total` and carry a
//! `bus` label with the bus name.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Registry holding every bus metric
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages the transport accepted
    pub static ref MESSAGES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_messages_sent_total", "Messages accepted by the transport"),
        &["bus"]
    ).expect("metric creation failed");

    /// Sends that resolved to false
    pub static ref SEND_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_send_failures_total", "Sends rejected or failed"),
        &["bus"]
    ).expect("metric creation failed");

    /// Inbound messages delivered to the receiver
    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_messages_received_total", "Inbound messages delivered"),
        &["bus"]
    ).expect("metric creation failed");

    /// Inbound messages dropped as already seen
    pub static ref DUPLICATES_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_duplicates_dropped_total", "Inbound messages dropped as already seen"),
        &["bus"]
    ).expect("metric creation failed");
}

/// Register all metrics with [`REGISTRY`]. Calling it again is harmless.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_SENT.clone()),
        Box::new(SEND_FAILURES.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(DUPLICATES_DROPPED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Running totals of one bus, as reported by the bus itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusTotals {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub duplicates_dropped: u64,
}

fn raise_to(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// Bring the counters of `bus` up to `totals`. Counters never go down, so a
/// restarted bus reporting smaller totals leaves them unchanged.
pub fn record_totals(bus: &str, totals: BusTotals) {
    raise_to(&MESSAGES_SENT.with_label_values(&[bus]), totals.sent);
    raise_to(&SEND_FAILURES.with_label_values(&[bus]), totals.send_failures);
    raise_to(&MESSAGES_RECEIVED.with_label_values(&[bus]), totals.received);
    raise_to(
        &DUPLICATES_DROPPED.with_label_values(&[bus]),
        totals.duplicates_dropped,
    );
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
