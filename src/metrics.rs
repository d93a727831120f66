//! Prometheus metrics for REITTI

use crate::error::{Error, Result};
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All REITTI metrics
pub struct Metrics {
    /// Records dispatched (by outcome)
    pub records_dispatched: CounterVec,

    /// Namespace lifecycle events handled (by action)
    pub namespace_events: CounterVec,

    /// Currently registered dynamic clients
    pub dynamic_clients: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at plugin construction)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            records_dispatched: register_counter_vec!(
                "reitti_records_dispatched_total",
                "Total records dispatched",
                &["outcome"]
            )
            .map_err(|e| Error::Metrics(format!("records_dispatched: {e}")))?,

            namespace_events: register_counter_vec!(
                "reitti_namespace_events_total",
                "Total namespace lifecycle events handled",
                &["action"]
            )
            .map_err(|e| Error::Metrics(format!("namespace_events: {e}")))?,

            dynamic_clients: register_gauge!(
                "reitti_dynamic_clients",
                "Number of registered dynamic clients"
            )
            .map_err(|e| Error::Metrics(format!("dynamic_clients: {e}")))?,
        };

        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| Error::Metrics("failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record a dispatched record by outcome ("sent", "consumed", "failed", ...)
    pub fn record_dispatched(&self, outcome: &str) {
        self.records_dispatched.with_label_values(&[outcome]).inc();
    }

    /// Record a handled namespace event ("created", "removed", "rejected", ...)
    pub fn record_namespace_event(&self, action: &str) {
        self.namespace_events.with_label_values(&[action]).inc();
    }

    /// Increment the dynamic client gauge
    pub fn inc_dynamic_clients(&self) {
        self.dynamic_clients.inc();
    }

    /// Decrement the dynamic client gauge
    pub fn dec_dynamic_clients(&self) {
        self.dynamic_clients.dec();
    }
}

/// Helper to record a dispatch outcome if metrics are initialized
pub fn try_record_dispatched(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.record_dispatched(outcome);
    }
}

/// Helper to record a namespace event if metrics are initialized
pub fn try_record_namespace_event(action: &str) {
    if let Some(m) = Metrics::get() {
        m.record_namespace_event(action);
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
