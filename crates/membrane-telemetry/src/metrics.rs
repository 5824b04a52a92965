//! Prometheus metrics for the membrane hub.
//!
//! All metrics follow the naming convention: `membrane_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts,
    Opts, Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Frames read from `/inject`
    pub static ref ENVELOPES_RECEIVED: Counter = Counter::new(
        "membrane_envelopes_received_total",
        "Total frames received on the inject endpoint"
    ).expect("metric creation failed");

    /// Envelopes that passed every gate, by kind
    pub static ref ENVELOPES_DISPATCHED: CounterVec = CounterVec::new(
        Opts::new("membrane_envelopes_dispatched_total", "Envelopes dispatched to subscribers"),
        &["kind"]
    ).expect("metric creation failed");

    /// Envelopes refused, by reason (decode/schema/auth/quota/rate_limited)
    pub static ref ENVELOPES_REJECTED: CounterVec = CounterVec::new(
        Opts::new("membrane_envelopes_rejected_total", "Envelopes rejected at the membrane"),
        &["reason"]
    ).expect("metric creation failed");

    /// Time from frame receipt to terminal stage
    pub static ref ADMISSION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "membrane_admission_duration_seconds",
            "Time spent running one frame through the admission pipeline"
        ).buckets(exponential_buckets(0.00005, 2.0, 14).expect("static bucket layout"))
    ).expect("metric creation failed");

    // =========================================================================
    // ECONOMY
    // =========================================================================

    /// Quotes admitted or settled by the quota gate
    pub static ref QUOTES_ADMITTED: Counter = Counter::new(
        "membrane_quotes_admitted_total",
        "Envelopes that passed the quota gate"
    ).expect("metric creation failed");

    /// Quotes issued by the in-process desk
    pub static ref QUOTES_ISSUED: Counter = Counter::new(
        "membrane_quotes_issued_total",
        "Quote responses issued by the hub"
    ).expect("metric creation failed");

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Deliveries that failed (closed or full subscriber queue)
    pub static ref DELIVERY_FAILURES: Counter = Counter::new(
        "membrane_delivery_failures_total",
        "Per-subscriber delivery failures"
    ).expect("metric creation failed");

    /// Live `(connection, channel)` subscriptions
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::new(
        "membrane_active_subscriptions",
        "Current number of channel subscriptions"
    ).expect("metric creation failed");

    /// Open WebSocket connections, by endpoint
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = GaugeVec::new(
        Opts::new("membrane_active_connections", "Open WebSocket connections"),
        &["endpoint"]
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; later calls are no-ops.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ENVELOPES_RECEIVED.clone()),
        Box::new(ENVELOPES_DISPATCHED.clone()),
        Box::new(ENVELOPES_REJECTED.clone()),
        Box::new(ADMISSION_DURATION.clone()),
        Box::new(QUOTES_ADMITTED.clone()),
        Box::new(QUOTES_ISSUED.clone()),
        Box::new(DELIVERY_FAILURES.clone()),
        Box::new(ACTIVE_SUBSCRIPTIONS.clone()),
        Box::new(ACTIVE_CONNECTIONS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
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

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_rejections_by_reason() {
        crate::metric_inc!(ENVELOPES_REJECTED, &["quota"]);
        assert!(ENVELOPES_REJECTED.with_label_values(&["quota"]).get() >= 1.0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        register_metrics().unwrap();
        ENVELOPES_RECEIVED.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("membrane_envelopes_received_total"));
    }

    #[test]
    fn test_histogram_timer() {
        let before = ADMISSION_DURATION.get_sample_count();
        {
            let _timer = crate::time_histogram!(ADMISSION_DURATION);
        }
        assert!(ADMISSION_DURATION.get_sample_count() > before);
    }
}
