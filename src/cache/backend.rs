//! Storage backends behind the feature cache.
//!
//! A backend only stores and expires-by-request; TTL checks and graceful
//! degradation live in [`super::FeatureCache`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::CacheEntry;
use crate::error::CacheError;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short identifier shown in health output (`memory`, `sqlite`, `none`).
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn health_check(&self) -> Result<(), CacheError>;
}

// ── In-memory ──────────────────────────────────────────────────────────────

/// Writes between sweeps of expired entries.
pub const DEFAULT_SWEEP_EVERY: usize = 256;

/// Process-local map. Expired entries are dropped when read, and swept out
/// every `sweep_every` writes so keys that are never read again do not pile
/// up.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    sweep_every: usize,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    writes_since_sweep: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_sweep_every(DEFAULT_SWEEP_EVERY)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_every(writes: usize) -> Self {
        MemoryBackend {
            state: Arc::new(RwLock::new(MemoryState::default())),
            sweep_every: writes.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Remove every expired entry now. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.state.write().await;
        state.writes_since_sweep = 0;
        Self::sweep(&mut state.entries)
    }

    fn sweep(entries: &mut HashMap<String, CacheEntry>) -> usize {
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.state.read().await.entries.get(key).cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state.entries.insert(entry.key.clone(), entry);
        state.writes_since_sweep += 1;
        if state.writes_since_sweep >= self.sweep_every {
            state.writes_since_sweep = 0;
            Self::sweep(&mut state.entries);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.state.write().await.entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - state.entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

// ── Disabled ───────────────────────────────────────────────────────────────

/// Stores nothing. Every lookup is a miss.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBackend;

#[async_trait]
impl CacheBackend for NoOpBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(key: String, ttl_ms: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key,
            value: vec![Some(1.0)],
            created_at: now,
            expires_at: now + ChronoDuration::milliseconds(ttl_ms),
        }
    }

    #[tokio::test]
    async fn test_unread_expired_entries_are_swept_on_write() {
        let memory = MemoryBackend::with_sweep_every(100);
        for i in 0..1000 {
            memory.set(entry(format!("feature:x:{i}"), 1)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // the 1100th write triggers the next sweep
        for i in 0..100 {
            memory
                .set(entry(format!("feature:y:{i}"), 60_000))
                .await
                .unwrap();
        }
        assert_eq!(memory.len().await, 100);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_entries() {
        let memory = MemoryBackend::new();
        memory.set(entry("feature:x:old".into(), -1)).await.unwrap();
        memory.set(entry("feature:x:new".into(), 60_000)).await.unwrap();

        assert_eq!(memory.sweep_expired().await, 1);
        assert_eq!(memory.len().await, 1);
        assert!(memory.get("feature:x:new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_prefix_counts() {
        let memory = MemoryBackend::new();
        memory.set(entry("feature:a:1".into(), 60_000)).await.unwrap();
        memory.set(entry("feature:a:2".into(), 60_000)).await.unwrap();
        memory.set(entry("feature:b:1".into(), 60_000)).await.unwrap();
        assert_eq!(memory.delete_prefix("feature:a:").await.unwrap(), 2);
        assert!(memory.delete("feature:b:1").await.unwrap());
        assert_eq!(memory.len().await, 0);
    }
}
