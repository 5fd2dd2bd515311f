//! Feature cache: (feature name, input fingerprint) → computed output.
//!
//! The cache is an optimisation, never a dependency. Backend failures are
//! logged and turn into a miss (reads) or a no-op (writes), so a broken
//! store never fails a feature request.

pub mod backend;
pub mod sqlite;

pub use backend::{CacheBackend, MemoryBackend, NoOpBackend};
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{Record, Value};

const KEY_PREFIX: &str = "feature:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<Option<f64>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache key for a feature over a row set: `feature:{name}:{sha256}`.
///
/// Every cell is hashed with a type tag, so `Null`, `NaN`, `±inf`, `1` and
/// `1.0` all key differently. Row order is kept; columns are `BTreeMap`
/// ordered.
pub fn fingerprint(feature_name: &str, rows: &[Record]) -> String {
    let mut hasher = Sha256::new();
    hash_text(&mut hasher, feature_name);
    hasher.update((rows.len() as u64).to_be_bytes());
    for row in rows {
        hasher.update((row.len() as u64).to_be_bytes());
        for (column, value) in row {
            hash_text(&mut hasher, column);
            hash_value(&mut hasher, value);
        }
    }
    format!(
        "{}{}:{}",
        KEY_PREFIX,
        feature_name,
        hex::encode(hasher.finalize())
    )
}

fn hash_text(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_be_bytes());
    hasher.update(text.as_bytes());
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"b1" } else { b"b0" }),
        Value::Int(i) => {
            hasher.update(b"i");
            hasher.update(i.to_be_bytes());
        }
        Value::Float(f) => {
            // all NaN payloads are the same input
            let bits = if f.is_nan() { f64::NAN.to_bits() } else { f.to_bits() };
            hasher.update(b"f");
            hasher.update(bits.to_be_bytes());
        }
        Value::Text(t) => {
            hasher.update(b"s");
            hash_text(hasher, t);
        }
    }
}

fn feature_prefix(feature_name: &str) -> String {
    format!("{}{}:", KEY_PREFIX, feature_name)
}

#[derive(Clone)]
pub struct FeatureCache {
    backend: Arc<dyn CacheBackend>,
}

impl FeatureCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        FeatureCache { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoOpBackend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Unexpired cached output for this exact input, if any.
    pub async fn get(&self, feature_name: &str, rows: &[Record]) -> Option<Vec<Option<f64>>> {
        let key = fingerprint(feature_name, rows);
        let entry = match self.backend.get(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Cache miss: {}", key);
                return None;
            }
            Err(e) => {
                warn!("⚠️ Cache read failed ({}), treating as miss: {}", self.backend.name(), e);
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            debug!("Cache entry expired: {}", key);
            if let Err(e) = self.backend.delete(&key).await {
                warn!("Failed to evict expired entry {}: {}", key, e);
            }
            return None;
        }

        debug!("Cache hit: {}", key);
        Some(entry.value)
    }

    /// Store a successful output. A zero TTL disables caching for the call.
    pub async fn put(&self, feature_name: &str, rows: &[Record], values: &[Option<f64>], ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = fingerprint(feature_name, rows);
        let ttl = match ChronoDuration::from_std(ttl) {
            Ok(ttl) => ttl,
            Err(_) => ChronoDuration::days(365),
        };
        let now = Utc::now();
        let entry = CacheEntry {
            key,
            value: values.to_vec(),
            created_at: now,
            expires_at: now + ttl,
        };
        if let Err(e) = self.backend.set(entry).await {
            warn!("⚠️ Cache write failed ({}), skipping: {}", self.backend.name(), e);
        }
    }

    /// Drop the entry for one exact input. Returns whether one existed.
    pub async fn invalidate(&self, feature_name: &str, rows: &[Record]) -> bool {
        let key = fingerprint(feature_name, rows);
        match self.backend.delete(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache invalidate failed for {}: {}", key, e);
                false
            }
        }
    }

    /// Drop every entry of one feature.
    pub async fn invalidate_feature(&self, feature_name: &str) -> u64 {
        self.delete_prefix(&feature_prefix(feature_name)).await
    }

    pub async fn invalidate_all(&self) -> u64 {
        self.delete_prefix(KEY_PREFIX).await
    }

    async fn delete_prefix(&self, prefix: &str) -> u64 {
        match self.backend.delete_prefix(prefix).await {
            Ok(n) => {
                debug!("Invalidated {} cache entries under '{}'", n, prefix);
                n
            }
            Err(e) => {
                warn!("Cache invalidation under '{}' failed: {}", prefix, e);
                0
            }
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self.backend.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache backend '{}' unhealthy: {}", self.backend.name(), e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::models::record;
    use async_trait::async_trait;

    /// Backend whose every operation fails, for degradation tests.
    pub(crate) struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _entry: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn health_check(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn rows(x: i64) -> Vec<Record> {
        vec![record([("x", Value::Int(x)), ("team", Value::from("STL"))])]
    }

    #[test]
    fn test_fingerprint_stable_and_discriminating() {
        let a = fingerprint("woba", &rows(1));
        assert_eq!(a, fingerprint("woba", &rows(1)));
        assert_ne!(a, fingerprint("woba", &rows(2)));
        assert_ne!(a, fingerprint("fip", &rows(1)));
        assert!(a.starts_with("feature:woba:"));
        assert_eq!(a.len(), "feature:woba:".len() + 64);
    }

    fn walk(bb: Value) -> Vec<Record> {
        vec![record([
            ("ab", Value::Int(4)),
            ("single", Value::Int(1)),
            ("bb", bb),
        ])]
    }

    #[test]
    fn test_fingerprint_keeps_non_finite_and_null_apart() {
        let keys = [
            fingerprint("woba", &walk(Value::Null)),
            fingerprint("woba", &walk(Value::Float(f64::NAN))),
            fingerprint("woba", &walk(Value::Float(f64::INFINITY))),
            fingerprint("woba", &walk(Value::Float(f64::NEG_INFINITY))),
            fingerprint("woba", &walk(Value::Float(1.0))),
            fingerprint("woba", &walk(Value::Int(1))),
            fingerprint("woba", &walk(Value::from("1"))),
            fingerprint("woba", &walk(Value::Bool(true))),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            fingerprint("woba", &walk(Value::Float(f64::NAN))),
            fingerprint("woba", &walk(Value::Float(-f64::NAN)))
        );
    }

    #[test]
    fn test_fingerprint_separates_cell_boundaries() {
        let joined = vec![record([("ab", Value::from("12"))])];
        let split = vec![record([("a", Value::from("b12"))])];
        assert_ne!(fingerprint("x", &joined), fingerprint("x", &split));
    }

    #[tokio::test]
    async fn test_nan_entry_is_not_served_for_null_input() {
        let cache = FeatureCache::in_memory();
        let ttl = Duration::from_secs(60);
        cache
            .put("woba", &walk(Value::Float(f64::NAN)), &[None], ttl)
            .await;
        assert!(cache.get("woba", &walk(Value::Null)).await.is_none());
        assert_eq!(
            cache.get("woba", &walk(Value::Float(f64::NAN))).await,
            Some(vec![None])
        );
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = FeatureCache::in_memory();
        assert!(cache.get("woba", &rows(1)).await.is_none());

        cache
            .put("woba", &rows(1), &[Some(0.3)], Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("woba", &rows(1)).await, Some(vec![Some(0.3)]));
        assert!(cache.get("woba", &rows(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = FeatureCache::in_memory();
        cache
            .put("woba", &rows(1), &[Some(0.3)], Duration::from_millis(20))
            .await;
        assert!(cache.get("woba", &rows(1)).await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("woba", &rows(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let memory = MemoryBackend::new();
        let cache = FeatureCache::new(Arc::new(memory.clone()));
        cache.put("woba", &rows(1), &[Some(0.3)], Duration::ZERO).await;
        assert_eq!(memory.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidation_scopes() {
        let cache = FeatureCache::in_memory();
        let ttl = Duration::from_secs(60);
        cache.put("woba", &rows(1), &[Some(0.3)], ttl).await;
        cache.put("woba", &rows(2), &[Some(0.4)], ttl).await;
        cache.put("fip", &rows(1), &[Some(3.0)], ttl).await;

        assert!(cache.invalidate("woba", &rows(1)).await);
        assert!(!cache.invalidate("woba", &rows(1)).await);
        assert_eq!(cache.invalidate_feature("woba").await, 1);
        assert!(cache.get("fip", &rows(1)).await.is_some());
        assert_eq!(cache.invalidate_all().await, 1);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_to_miss() {
        let cache = FeatureCache::new(Arc::new(BrokenBackend));
        cache
            .put("woba", &rows(1), &[Some(0.3)], Duration::from_secs(60))
            .await;
        assert!(cache.get("woba", &rows(1)).await.is_none());
        assert!(!cache.is_healthy().await);
        assert_eq!(cache.invalidate_all().await, 0);
    }

    #[tokio::test]
    async fn test_sqlite_backend_through_cache() {
        let cache = FeatureCache::new(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        cache
            .put("epa", &rows(7), &[Some(-1.5)], Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("epa", &rows(7)).await, Some(vec![Some(-1.5)]));
        assert_eq!(cache.backend_name(), "sqlite");
        assert!(cache.is_healthy().await);
    }
}
