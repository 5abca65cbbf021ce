//! Prometheus metrics for the gateway
//!
//! Every collector lives in a private [`Registry`] owned by
//! [`GatewayMetrics`], so several gateways (for example in tests) can coexist
//! in one process without duplicate-registration errors.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Metrics collector for the gateway
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    cache_lookups_total: IntCounterVec,
    cache_writes_total: IntCounterVec,
    upstream_requests_total: IntCounterVec,
    upstream_duration_seconds: HistogramVec,
    credential_refreshes_total: IntCounterVec,
}

/// Point-in-time view of the counters most useful for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub cache_writes: u64,
    pub predict_calls: u64,
    pub tile_calls: u64,
    pub upstream_failures: u64,
    pub credential_refreshes: u64,
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}

impl GatewayMetrics {
    /// Create metrics backed by a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics with custom registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of HTTP requests handled"),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Duration of HTTP requests in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["route"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new(
                "gateway_cache_lookups_total",
                "Embedding cache lookups by result",
            ),
            &["result"], // hit, miss, error
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_writes_total = IntCounterVec::new(
            Opts::new("gateway_cache_writes_total", "Embedding cache writes by result"),
            &["result"], // ok, error
        )?;
        registry.register(Box::new(cache_writes_total.clone()))?;

        let upstream_requests_total = IntCounterVec::new(
            Opts::new(
                "gateway_upstream_requests_total",
                "Requests sent to upstream services",
            ),
            &["service", "result"], // service: predict, tile; result: success, failure
        )?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_duration_seconds",
                "Duration of upstream calls in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["service"],
        )?;
        registry.register(Box::new(upstream_duration_seconds.clone()))?;

        let credential_refreshes_total = IntCounterVec::new(
            Opts::new(
                "gateway_credential_refreshes_total",
                "Service credential refresh attempts",
            ),
            &["result"],
        )?;
        registry.register(Box::new(credential_refreshes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            cache_lookups_total,
            cache_writes_total,
            upstream_requests_total,
            upstream_duration_seconds,
            credential_refreshes_total,
        })
    }

    pub fn record_request(&self, route: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn record_cache_hit(&self) {
        self.cache_lookups_total.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_lookups_total.with_label_values(&["miss"]).inc();
    }

    pub fn record_cache_error(&self) {
        self.cache_lookups_total.with_label_values(&["error"]).inc();
    }

    pub fn record_cache_write(&self, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.cache_writes_total.with_label_values(&[result]).inc();
    }

    pub fn record_upstream(&self, service: &str, success: bool, duration: Duration) {
        let result = if success { "success" } else { "failure" };
        self.upstream_requests_total
            .with_label_values(&[service, result])
            .inc();
        self.upstream_duration_seconds
            .with_label_values(&[service])
            .observe(duration.as_secs_f64());
    }

    pub fn record_credential_refresh(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.credential_refreshes_total
            .with_label_values(&[result])
            .inc();
    }

    /// Get a snapshot of the main counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let lookups = |result: &str| self.cache_lookups_total.with_label_values(&[result]).get();
        let upstream = |service: &str, result: &str| {
            self.upstream_requests_total
                .with_label_values(&[service, result])
                .get()
        };

        MetricsSnapshot {
            cache_hits: lookups("hit"),
            cache_misses: lookups("miss"),
            cache_errors: lookups("error"),
            cache_writes: self.cache_writes_total.with_label_values(&["ok"]).get(),
            predict_calls: upstream("predict", "success") + upstream("predict", "failure"),
            tile_calls: upstream("tile", "success") + upstream("tile", "failure"),
            upstream_failures: upstream("predict", "failure") + upstream("tile", "failure"),
            credential_refreshes: self
                .credential_refreshes_total
                .with_label_values(&["success"])
                .get(),
        }
    }

    /// Render all metrics in Prometheus text format
    ///
    /// # Returns
    /// The content type and the encoded body
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
