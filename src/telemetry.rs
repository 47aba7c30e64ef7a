//! Hit/miss telemetry for the caching layer
//!
//! Samples land in a bounded ring buffer (oldest dropped at capacity);
//! aggregates are running counts and incremental averages, never an
//! unbounded history.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a recorded read was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Served from cache
    Hit,
    /// Served from the network
    Miss,
}

/// One recorded read
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub metric: String,
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated snapshot of cache performance
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceReport {
    pub hits: u64,
    pub misses: u64,
    /// Average time for cache-served reads in ms
    pub avg_cache_ms: f64,
    /// Average time for network-served reads in ms
    pub avg_network_ms: f64,
    /// Cache speedup over the network path, as a percentage.
    /// `None` until at least one network read has been timed.
    pub speedup_percent: Option<f64>,
}

#[derive(Default)]
struct TelemetryInner {
    hits: u64,
    misses: u64,
    avg_cache_ms: f64,
    avg_network_ms: f64,
    samples: VecDeque<TelemetrySample>,
}

/// Records hit/miss outcomes and timings; snapshot via [`report`](Self::report)
pub struct TelemetryRecorder {
    capacity: usize,
    inner: RwLock<TelemetryInner>,
}

impl TelemetryRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(TelemetryInner::default()),
        }
    }

    /// Record one read. Averages update incrementally:
    /// `avg_new = avg_old + (sample - avg_old) / count`.
    pub fn record(&self, metric: &str, duration_ms: f64, outcome: Outcome) {
        if let Ok(mut inner) = self.inner.write() {
            match outcome {
                Outcome::Hit => {
                    inner.hits += 1;
                    let n = inner.hits as f64;
                    inner.avg_cache_ms += (duration_ms - inner.avg_cache_ms) / n;
                }
                Outcome::Miss => {
                    inner.misses += 1;
                    let n = inner.misses as f64;
                    inner.avg_network_ms += (duration_ms - inner.avg_network_ms) / n;
                }
            }

            if inner.samples.len() >= self.capacity {
                inner.samples.pop_front();
            }
            inner.samples.push_back(TelemetrySample {
                metric: metric.to_string(),
                duration_ms,
                outcome,
                recorded_at: Utc::now(),
            });
        }
    }

    /// Aggregated snapshot. The speedup derivation guards division by zero:
    /// it is only computed once a network read has been timed.
    pub fn report(&self) -> PerformanceReport {
        let Ok(inner) = self.inner.read() else {
            return PerformanceReport::default();
        };

        let speedup_percent = if inner.avg_network_ms > 0.0 {
            Some((inner.avg_network_ms - inner.avg_cache_ms) / inner.avg_network_ms * 100.0)
        } else {
            None
        };

        PerformanceReport {
            hits: inner.hits,
            misses: inner.misses,
            avg_cache_ms: inner.avg_cache_ms,
            avg_network_ms: inner.avg_network_ms,
            speedup_percent,
        }
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.inner
            .read()
            .map(|inner| inner.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all counters and samples
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = TelemetryInner::default();
        }
    }
}
