//! Per-feature circuit breakers.
//!
//! State machine:
//!
//! ```text
//!   Closed ──(failures ≥ threshold)──▶ Open
//!   Open ──(recovery_timeout since last failure, on next access)──▶ HalfOpen
//!   HalfOpen ──success──▶ Closed        HalfOpen ──failure──▶ Open
//!   any ──success──▶ Closed (failure count reset)
//! ```
//!
//! Each breaker owns its own mutex, so features never contend with each
//! other. Callers hold a [`BreakerPermit`] for the duration of one attempt
//! and settle it with `success()` / `failure()`; dropping an unsettled
//! permit (a cache hit, a cancelled request) leaves the counters untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::FeatureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of one breaker, as reported by health output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Monotonic clock for the recovery interval.
    last_failure: Option<Instant>,
    /// Wall clock, for reporting only.
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    feature: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(feature: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            feature: feature.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to run one attempt. Fails fast with `CircuitOpen` while the
    /// breaker is open, or while a half-open trial is already running.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, FeatureError> {
        let mut s = self.lock();
        let trial = match s.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let recovered = s
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return Err(FeatureError::CircuitOpen(self.feature.clone()));
                }
                info!(
                    "🔌 Circuit breaker '{}' half-open after {:?}, allowing one trial",
                    self.feature, self.config.recovery_timeout
                );
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    return Err(FeatureError::CircuitOpen(self.feature.clone()));
                }
                s.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut s = self.lock();
        if s.state != CircuitState::Closed {
            info!(
                "✅ Circuit breaker '{}' closed again (was {:?})",
                self.feature, s.state
            );
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut s = self.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(Instant::now());
        s.last_failure_at = Some(Utc::now());

        match s.state {
            CircuitState::HalfOpen => {
                warn!(
                    "🔴 Circuit breaker '{}' trial failed, re-opening",
                    self.feature
                );
                s.state = CircuitState::Open;
                s.trial_in_flight = false;
            }
            CircuitState::Closed if s.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    "🔴 Circuit breaker '{}' opened after {} consecutive failures",
                    self.feature, s.consecutive_failures
                );
                s.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut s = self.lock();
        s.trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.lock();
        BreakerSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            last_failure_at: s.last_failure_at,
        }
    }
}

/// Permission to make one attempt against a feature.
#[must_use = "settle the permit with success() or failure()"]
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }

    /// Give the permit back without an outcome (e.g. served from cache).
    pub fn release(self) {}
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Lazily-created breakers keyed by feature name.
#[derive(Debug, Default)]
pub struct BreakerBoard {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        BreakerBoard {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The breaker for `feature`, created Closed on first use.
    pub fn get(&self, feature: &str) -> Arc<CircuitBreaker> {
        let mut map = self.map();
        if let Some(b) = map.get(feature) {
            return Arc::clone(b);
        }
        let breaker = Arc::new(CircuitBreaker::new(feature, self.config));
        map.insert(feature.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.map().values().cloned().collect();
        breakers
            .iter()
            .map(|b| (b.feature.clone(), b.snapshot()))
            .collect()
    }

    pub fn any_open(&self) -> bool {
        self.snapshot()
            .values()
            .any(|s| s.state == CircuitState::Open)
    }
}
