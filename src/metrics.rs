//! Request counters, latency averages and the health report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::error::ErrorKind;
use crate::models::FeatureResponse;

/// At or below this success rate the service reports itself degraded.
pub const HEALTHY_SUCCESS_RATE: f64 = 0.90;

#[derive(Debug, Default, Clone)]
struct FeatureCounters {
    requests: u64,
    successes: u64,
    failures: u64,
    cache_hits: u64,
    latency_ms_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
    pub features: BTreeMap<String, FeatureMetrics>,
    pub started_at: DateTime<Utc>,
}

/// Lock-light counters shared by every in-flight request.
#[derive(Debug)]
pub struct MetricsReporter {
    requests_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_micros_total: AtomicU64,
    failures_by_kind: Mutex<BTreeMap<ErrorKind, u64>>,
    per_feature: Mutex<HashMap<String, FeatureCounters>>,
    started_at: DateTime<Utc>,
}

impl Default for MetricsReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsReporter {
    pub fn new() -> Self {
        MetricsReporter {
            requests_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            latency_micros_total: AtomicU64::new(0),
            failures_by_kind: Mutex::new(BTreeMap::new()),
            per_feature: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account for one finished request.
    pub fn record_response(&self, response: &FeatureResponse) {
        let micros = response.computed_in.as_micros().min(u64::MAX as u128) as u64;
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.latency_micros_total.fetch_add(micros, Ordering::Relaxed);

        match &response.error {
            None => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Some(info) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                *relock(&self.failures_by_kind).entry(info.kind).or_insert(0) += 1;
                // unregistered names are not tracked per feature
                if info.kind == ErrorKind::NotFound {
                    return;
                }
            }
        }

        let mut per_feature = relock(&self.per_feature);
        let counters = per_feature
            .entry(response.feature_name.clone())
            .or_default();
        counters.requests += 1;
        counters.latency_ms_total += micros as f64 / 1000.0;
        if response.is_success() {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
        if response.cache_hit {
            counters.cache_hits += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let latency_micros = self.latency_micros_total.load(Ordering::Relaxed);

        let features = relock(&self.per_feature)
            .iter()
            .map(|(name, c)| {
                let avg = if c.requests == 0 {
                    0.0
                } else {
                    c.latency_ms_total / c.requests as f64
                };
                (
                    name.clone(),
                    FeatureMetrics {
                        requests: c.requests,
                        successes: c.successes,
                        failures: c.failures,
                        cache_hits: c.cache_hits,
                        avg_latency_ms: avg,
                    },
                )
            })
            .collect();

        let lookups = cache_hits + cache_misses;
        MetricsSnapshot {
            requests_total,
            successes,
            failures,
            success_rate: if requests_total == 0 {
                1.0
            } else {
                successes as f64 / requests_total as f64
            },
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            avg_latency_ms: if requests_total == 0 {
                0.0
            } else {
                latency_micros as f64 / 1000.0 / requests_total as f64
            },
            failures_by_kind: relock(&self.failures_by_kind).clone(),
            features,
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cache_backend: String,
    pub cache_healthy: bool,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn assess(
        metrics: &MetricsSnapshot,
        cache_backend: &str,
        cache_healthy: bool,
        breakers: BTreeMap<String, BreakerSnapshot>,
    ) -> Self {
        let breaker_open = breakers.values().any(|b| b.state == CircuitState::Open);
        let failing =
            metrics.requests_total > 0 && metrics.success_rate <= HEALTHY_SUCCESS_RATE;
        let status = if !cache_healthy || breaker_open || failing {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            cache_backend: cache_backend.to_string(),
            cache_healthy,
            success_rate: metrics.success_rate,
            cache_hit_rate: metrics.cache_hit_rate,
            avg_latency_ms: metrics.avg_latency_ms,
            breakers,
            generated_at: Utc::now(),
        }
    }
}
