//! Admission and generation metrics.
//!
//! Plain atomics; export is left to the embedding service.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram over fixed upper bounds; the last bucket catches the rest.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn token_estimates() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value.max(0.0).round() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

#[derive(Debug)]
pub struct GateMetrics {
    pub admitted: Counter,
    pub rejected_unauthorized: Counter,
    pub rejected_forbidden: Counter,
    pub rejected_rate_limited: Counter,
    pub estimated_tokens: Histogram,
    pub generations_in_flight: Gauge,
    pub generation_success: Counter,
    pub generation_failure: Counter,
    pub tokens_consumed: Counter,
    pub anonymous_usage_skipped: Counter,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self {
            admitted: Counter::new(),
            rejected_unauthorized: Counter::new(),
            rejected_forbidden: Counter::new(),
            rejected_rate_limited: Counter::new(),
            estimated_tokens: Histogram::token_estimates(),
            generations_in_flight: Gauge::new(),
            generation_success: Counter::new(),
            generation_failure: Counter::new(),
            tokens_consumed: Counter::new(),
            anonymous_usage_skipped: Counter::new(),
        }
    }

    pub fn record_admission(&self, estimated_tokens: f64) {
        self.admitted.inc();
        self.estimated_tokens.observe(estimated_tokens);
    }

    pub fn record_rejection(&self, error: &crate::Error) {
        match error {
            crate::Error::Unauthorized => self.rejected_unauthorized.inc(),
            crate::Error::Forbidden { .. } | crate::Error::ThreadNotFound { .. } => {
                self.rejected_forbidden.inc()
            }
            crate::Error::RateLimited { .. } => self.rejected_rate_limited.inc(),
            _ => {}
        }
    }

    pub fn record_generation_start(&self) {
        self.generations_in_flight.inc();
    }

    pub fn record_generation_end(&self, success: bool) {
        self.generations_in_flight.dec();
        if success {
            self.generation_success.inc();
        } else {
            self.generation_failure.inc();
        }
    }

    pub fn record_tokens(&self, total: u64) {
        self.tokens_consumed.add(total);
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`GateMetrics`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSummary {
    pub admitted: u64,
    pub rejected_unauthorized: u64,
    pub rejected_forbidden: u64,
    pub rejected_rate_limited: u64,
    pub avg_estimated_tokens: f64,
    /// Admissions per estimate bucket of [`Histogram::token_estimates`], the
    /// last entry counting estimates above 10k.
    pub estimated_tokens_buckets: Vec<u64>,
    pub generations_in_flight: i64,
    pub generation_success: u64,
    pub generation_failure: u64,
    pub tokens_consumed: u64,
}

impl MetricsSummary {
    pub fn from_metrics(metrics: &GateMetrics) -> Self {
        let count = metrics.estimated_tokens.count();
        let avg_estimated_tokens = if count > 0 {
            metrics.estimated_tokens.sum() as f64 / count as f64
        } else {
            0.0
        };

        Self {
            admitted: metrics.admitted.get(),
            rejected_unauthorized: metrics.rejected_unauthorized.get(),
            rejected_forbidden: metrics.rejected_forbidden.get(),
            rejected_rate_limited: metrics.rejected_rate_limited.get(),
            avg_estimated_tokens,
            estimated_tokens_buckets: metrics.estimated_tokens.bucket_counts(),
            generations_in_flight: metrics.generations_in_flight.get(),
            generation_success: metrics.generation_success.get(),
            generation_failure: metrics.generation_failure.get(),
            tokens_consumed: metrics.tokens_consumed.get(),
        }
    }
}
