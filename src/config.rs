use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::cache::{FeatureCache, SqliteBackend};
use crate::pipeline::{ClassPolicy, PipelinePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackendKind {
    /// Process-local map
    Memory,
    /// SQLite file at --cache-path
    Sqlite,
    /// Caching disabled
    #[value(name = "none")]
    Disabled,
}

/// Real-time sports feature-serving pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "feature-pipeline", version, about)]
pub struct Config {
    /// HTTP API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Maximum number of feature computations running at once
    #[arg(long, env = "FEATURE_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Consecutive failures before a feature's breaker opens
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "5")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a trial call
    #[arg(long, env = "BREAKER_RECOVERY_SECS", default_value = "60")]
    pub recovery_timeout_secs: u64,

    /// Cache backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "memory")]
    pub cache_backend: CacheBackendKind,

    /// SQLite cache path (sqlite backend only)
    #[arg(long, env = "CACHE_PATH", default_value = "feature_cache.db")]
    pub cache_path: String,

    /// Cache TTL for real-time features (seconds)
    #[arg(long, env = "REAL_TIME_TTL_SECS", default_value = "30")]
    pub real_time_ttl_secs: u64,

    /// Cache TTL for near-real-time features (seconds)
    #[arg(long, env = "NEAR_REAL_TIME_TTL_SECS", default_value = "300")]
    pub near_real_time_ttl_secs: u64,

    /// Cache TTL for batch features (seconds)
    #[arg(long, env = "BATCH_TTL_SECS", default_value = "600")]
    pub batch_ttl_secs: u64,

    /// Default timeout for real-time features (milliseconds)
    #[arg(long, env = "REAL_TIME_TIMEOUT_MS", default_value = "100")]
    pub real_time_timeout_ms: u64,

    /// Default timeout for near-real-time features (milliseconds)
    #[arg(long, env = "NEAR_REAL_TIME_TIMEOUT_MS", default_value = "500")]
    pub near_real_time_timeout_ms: u64,

    /// Default timeout for batch features (milliseconds)
    #[arg(long, env = "BATCH_TIMEOUT_MS", default_value = "5000")]
    pub batch_timeout_ms: u64,

    /// JSON manifest restricting and re-parameterising the built-in features
    #[arg(long, env = "FEATURE_MANIFEST")]
    pub feature_manifest: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.failure_threshold == 0 {
            bail!("failure_threshold must be at least 1");
        }
        for (name, ms) in [
            ("real_time_timeout_ms", self.real_time_timeout_ms),
            ("near_real_time_timeout_ms", self.near_real_time_timeout_ms),
            ("batch_timeout_ms", self.batch_timeout_ms),
        ] {
            if ms == 0 {
                bail!("{} must be positive", name);
            }
        }
        if self.cache_backend == CacheBackendKind::Sqlite && self.cache_path.trim().is_empty() {
            bail!("CACHE_PATH is required for the sqlite cache backend");
        }
        Ok(())
    }

    pub fn policy(&self) -> PipelinePolicy {
        let class = |ttl_secs: u64, timeout_ms: u64| ClassPolicy {
            cache_ttl: Duration::from_secs(ttl_secs),
            timeout: Duration::from_millis(timeout_ms),
        };
        PipelinePolicy {
            workers: self.workers,
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            },
            real_time: class(self.real_time_ttl_secs, self.real_time_timeout_ms),
            near_real_time: class(self.near_real_time_ttl_secs, self.near_real_time_timeout_ms),
            batch: class(self.batch_ttl_secs, self.batch_timeout_ms),
        }
    }

    pub fn build_cache(&self) -> Result<FeatureCache> {
        Ok(match self.cache_backend {
            CacheBackendKind::Memory => FeatureCache::in_memory(),
            CacheBackendKind::Sqlite => {
                FeatureCache::new(Arc::new(SqliteBackend::open(&self.cache_path)?))
            }
            CacheBackendKind::Disabled => FeatureCache::disabled(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["feature-pipeline"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_policy_defaults() {
        let config = parse(&[]);
        config.validate().unwrap();
        let policy = config.policy();
        let defaults = PipelinePolicy::default();
        assert_eq!(policy.workers, defaults.workers);
        assert_eq!(policy.real_time, defaults.real_time);
        assert_eq!(policy.near_real_time, defaults.near_real_time);
        assert_eq!(policy.batch, defaults.batch);
        assert_eq!(policy.breaker.failure_threshold, 5);
        assert_eq!(policy.breaker.recovery_timeout, Duration::from_secs(60));
        assert_eq!(config.cache_backend, CacheBackendKind::Memory);
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        assert!(parse(&["--workers", "0"]).validate().is_err());
        assert!(parse(&["--failure-threshold", "0"]).validate().is_err());
        assert!(parse(&["--real-time-timeout-ms", "0"]).validate().is_err());
        assert!(parse(&["--cache-backend", "sqlite", "--cache-path", " "])
            .validate()
            .is_err());
    }

    #[test]
    fn test_backend_selection() {
        let config = parse(&["--cache-backend", "none"]);
        assert_eq!(config.build_cache().unwrap().backend_name(), "none");
        assert!(Config::try_parse_from(["feature-pipeline", "--cache-backend", "redis"]).is_err());
    }
}
