//! Request dispatcher: registry lookup, breaker gate, cache, bounded
//! execution and metrics, for one request or a batch.
//!
//! Per request:
//!
//! 1. resolve the feature (`NotFound` never touches breaker or cache)
//! 2. acquire a breaker permit (`CircuitOpen` returns before any cache read)
//! 3. cache lookup; a hit returns without invoking the formula
//! 4. run the formula on the worker pool under the request's time budget
//! 5. settle the breaker, write through to cache on success
//! 6. record metrics, return exactly one response

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerBoard, BreakerConfig, BreakerSnapshot};
use crate::cache::FeatureCache;
use crate::error::FeatureError;
use crate::features::features_for_sport;
use crate::metrics::{HealthReport, MetricsReporter, MetricsSnapshot};
use crate::models::{FeatureRequest, FeatureResponse, Record};
use crate::registry::{FeatureDefinition, FeatureRegistry, LatencyClass};
use crate::stream::{EventFeatures, SportEvent};

/// Cache TTL and default timeout for one latency class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassPolicy {
    pub cache_ttl: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    /// Maximum number of formulas executing at once.
    pub workers: usize,
    pub breaker: BreakerConfig,
    pub real_time: ClassPolicy,
    pub near_real_time: ClassPolicy,
    pub batch: ClassPolicy,
}

impl PipelinePolicy {
    pub fn for_class(&self, class: LatencyClass) -> ClassPolicy {
        match class {
            LatencyClass::RealTime => self.real_time,
            LatencyClass::NearRealTime => self.near_real_time,
            LatencyClass::Batch => self.batch,
        }
    }
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        PipelinePolicy {
            workers: 4,
            breaker: BreakerConfig::default(),
            real_time: ClassPolicy {
                cache_ttl: Duration::from_secs(30),
                timeout: Duration::from_millis(100),
            },
            near_real_time: ClassPolicy {
                cache_ttl: Duration::from_secs(300),
                timeout: Duration::from_millis(500),
            },
            batch: ClassPolicy {
                cache_ttl: Duration::from_secs(600),
                timeout: Duration::from_millis(5000),
            },
        }
    }
}

/// Cheap to clone; all clones share registry, cache, breakers and metrics.
#[derive(Clone)]
pub struct FeaturePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    registry: Arc<FeatureRegistry>,
    cache: FeatureCache,
    breakers: BreakerBoard,
    metrics: MetricsReporter,
    workers: Arc<Semaphore>,
    policy: PipelinePolicy,
}

impl FeaturePipeline {
    pub fn new(registry: FeatureRegistry, cache: FeatureCache, policy: PipelinePolicy) -> Self {
        let workers = policy.workers.max(1);
        info!(
            "Feature pipeline ready ({} features, {} workers, cache={})",
            registry.len(),
            workers,
            cache.backend_name()
        );
        FeaturePipeline {
            inner: Arc::new(PipelineInner {
                registry: Arc::new(registry),
                cache,
                breakers: BreakerBoard::new(policy.breaker),
                metrics: MetricsReporter::new(),
                workers: Arc::new(Semaphore::new(workers)),
                policy,
            }),
        }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.inner.cache
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.inner.policy
    }

    // ── Invocation ──────────────────────────────────────────────────────────

    /// Serve one request. Always produces exactly one response; failures are
    /// carried in `FeatureResponse.error`.
    pub async fn dispatch(&self, request: FeatureRequest) -> FeatureResponse {
        self.serve(&request).await.0
    }

    /// Serve every request concurrently. Responses come back in request
    /// order and one request's failure never affects another's.
    pub async fn dispatch_batch(&self, requests: Vec<FeatureRequest>) -> Vec<FeatureResponse> {
        let n = requests.len();
        let started = Instant::now();
        let futures: Vec<_> = requests
            .into_iter()
            .map(|request| self.dispatch(request))
            .collect();
        let responses = futures_util::future::join_all(futures).await;
        debug!("Batch of {} request(s) served in {:?}", n, started.elapsed());
        responses
    }

    /// Single call returning the values directly.
    pub async fn compute(
        &self,
        feature_name: &str,
        rows: Vec<Record>,
    ) -> Result<Vec<Option<f64>>, FeatureError> {
        let request = FeatureRequest::new(feature_name, rows);
        match self.serve(&request).await {
            (_, Some(err)) => Err(err),
            (response, None) => Ok(response.output_values),
        }
    }

    /// Fan one sport event out to the sport's default feature set.
    pub async fn compute_for_event(&self, event: SportEvent) -> EventFeatures {
        let features = features_for_sport(&event.sport);
        if features.is_empty() {
            warn!(
                "No features configured for sport '{}' (event {})",
                event.sport, event.event_id
            );
        }
        let rows = Arc::new(event.rows);
        let requests = features
            .iter()
            .filter(|name| self.inner.registry.contains(name))
            .map(|name| {
                FeatureRequest::shared(*name, Arc::clone(&rows))
                    .with_request_id(format!("{}:{}", event.event_id, name))
            })
            .collect();
        let responses = self.dispatch_batch(requests).await;
        EventFeatures {
            event_id: event.event_id,
            sport: event.sport,
            responses,
        }
    }

    async fn serve(&self, request: &FeatureRequest) -> (FeatureResponse, Option<FeatureError>) {
        let started = Instant::now();
        let (response, error) = match self.run(request).await {
            Ok((values, cache_hit)) => (
                FeatureResponse::success(request, values, started.elapsed(), cache_hit),
                None,
            ),
            Err(err) => {
                debug!("Request {} failed: {}", request.request_id(), err);
                (
                    FeatureResponse::failure(request, &err, started.elapsed()),
                    Some(err),
                )
            }
        };
        self.inner.metrics.record_response(&response);
        (response, error)
    }

    async fn run(&self, request: &FeatureRequest) -> Result<(Vec<Option<f64>>, bool), FeatureError> {
        let inner = &self.inner;
        let definition = inner.registry.resolve(request.feature_name())?;
        let permit = inner.breakers.get(&definition.name).try_acquire()?;

        if let Some(values) = inner.cache.get(&definition.name, request.rows()).await {
            inner.metrics.record_cache_lookup(true);
            permit.release();
            return Ok((values, true));
        }
        inner.metrics.record_cache_lookup(false);

        let class = inner.policy.for_class(definition.latency_class);
        let budget = request.timeout().unwrap_or(class.timeout);

        match self
            .execute(Arc::clone(&definition), request.shared_rows(), budget)
            .await
        {
            Ok(values) => {
                permit.success();
                let ttl = request.cache_ttl().unwrap_or(class.cache_ttl);
                inner
                    .cache
                    .put(&definition.name, request.rows(), &values, ttl)
                    .await;
                Ok((values, false))
            }
            Err(err) => {
                if err.counts_against_breaker() {
                    permit.failure();
                } else {
                    permit.release();
                }
                Err(err)
            }
        }
    }

    /// Run the formula on a blocking worker, bounded by `budget`. Waiting
    /// for a worker slot counts against the budget. On timeout we stop
    /// waiting; the computation itself is not cancelled and keeps its slot
    /// until it returns.
    async fn execute(
        &self,
        definition: Arc<FeatureDefinition>,
        rows: Arc<Vec<Record>>,
        budget: Duration,
    ) -> Result<Vec<Option<f64>>, FeatureError> {
        let feature = definition.name.clone();
        let job = run_on_worker(Arc::clone(&self.inner.workers), definition, rows);

        match tokio::time::timeout(budget, job).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏱️ Feature '{}' exceeded {:?} budget", feature, budget);
                Err(FeatureError::TimeoutExceeded {
                    feature,
                    timeout: budget,
                })
            }
        }
    }

    // ── Observability ───────────────────────────────────────────────────────

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn breaker_snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.inner.breakers.snapshot()
    }

    pub async fn health(&self) -> HealthReport {
        let cache_healthy = self.inner.cache.is_healthy().await;
        HealthReport::assess(
            &self.inner.metrics.snapshot(),
            self.inner.cache.backend_name(),
            cache_healthy,
            self.inner.breakers.snapshot(),
        )
    }
}

async fn run_on_worker(
    workers: Arc<Semaphore>,
    definition: Arc<FeatureDefinition>,
    rows: Arc<Vec<Record>>,
) -> Result<Vec<Option<f64>>, FeatureError> {
    let feature = definition.name.clone();
    let slot = workers
        .acquire_owned()
        .await
        .map_err(|_| FeatureError::ContractViolation {
            feature: feature.clone(),
            detail: "worker pool is closed".to_string(),
        })?;

    tokio::task::spawn_blocking(move || {
        let _slot = slot;
        definition.run(&rows)
    })
    .await
    .map_err(|e| {
        error!("🚨 Feature '{}' aborted on its worker: {}", feature, e);
        FeatureError::ContractViolation {
            feature,
            detail: format!("computation aborted: {}", e),
        }
    })?
}
