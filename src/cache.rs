//! Keyed in-memory cache with TTL policies and single-flight refresh.
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Normal freshness window.
    pub ttl: Duration,
    /// Hard ceiling; never served as fresh past this age.
    pub max_age: Duration,
}

impl CachePolicy {
    pub fn new(ttl: Duration, max_age: Duration) -> Self {
        Self { ttl, max_age }
    }

    pub fn is_fresh(&self, age: Duration) -> bool {
        age < self.ttl && age < self.max_age
    }
}

#[derive(Debug)]
pub struct CacheEntry<V> {
    pub timestamp: Instant,
    pub data: Option<Arc<V>>,
    /// Source row count the data was built from.
    pub count: u64,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            data: self.data.clone(),
            count: self.count,
        }
    }
}

struct Slot<V> {
    entry: RwLock<Option<CacheEntry<V>>>,
    force: AtomicBool,
    refresh: Mutex<()>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            entry: RwLock::new(None),
            force: AtomicBool::new(false),
            refresh: Mutex::new(()),
        }
    }
}

impl<V> Slot<V> {
    async fn fresh(&self, policy: &CachePolicy) -> Option<Arc<V>> {
        if self.force.load(Ordering::Acquire) {
            return None;
        }
        let entry = self.entry.read().await;
        let entry = entry.as_ref()?;
        if policy.is_fresh(entry.timestamp.elapsed()) {
            entry.data.clone()
        } else {
            None
        }
    }

    async fn stale(&self) -> Option<Arc<V>> {
        self.entry.read().await.as_ref().and_then(|e| e.data.clone())
    }

    async fn store(&self, value: V, count: u64) -> Arc<V> {
        let data = Arc::new(value);
        *self.entry.write().await = Some(CacheEntry {
            timestamp: Instant::now(),
            data: Some(data.clone()),
            count,
        });
        self.force.store(false, Ordering::Release);
        data
    }
}

/// Result of an explicit refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Done,
    /// Another refresh of the same key was already running.
    InFlight,
}

pub struct Cache<K, V> {
    default_policy: CachePolicy,
    policies: HashMap<K, CachePolicy>,
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(default_policy: CachePolicy) -> Self {
        Self {
            default_policy,
            policies: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Override the policy for one key.
    pub fn with_policy(mut self, key: K, policy: CachePolicy) -> Self {
        self.policies.insert(key, policy);
        self
    }

    pub fn policy(&self, key: &K) -> CachePolicy {
        self.policies.get(key).copied().unwrap_or(self.default_policy)
    }

    async fn slot(&self, key: &K) -> Arc<Slot<V>> {
        let mut slots = self.slots.lock().await;
        slots.entry(key.clone()).or_default().clone()
    }

    /// Cached value if still fresh, otherwise load it. Concurrent callers
    /// for one key share a single load. When the load fails and an older
    /// value exists, the older value is returned.
    pub async fn get_with<F, Fut, E>(&self, key: &K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, u64), E>>,
        E: std::fmt::Display,
    {
        let policy = self.policy(key);
        let slot = self.slot(key).await;
        if let Some(hit) = slot.fresh(&policy).await {
            return Ok(hit);
        }

        let _flight = slot.refresh.lock().await;
        if let Some(hit) = slot.fresh(&policy).await {
            debug!(?key, "filled by concurrent refresh");
            return Ok(hit);
        }

        match load().await {
            Ok((value, count)) => Ok(slot.store(value, count).await),
            Err(err) => match slot.stale().await {
                Some(stale) => {
                    warn!(?key, %err, "refresh failed, serving stale data");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    /// Load unconditionally unless a refresh of `key` is already running.
    /// On failure the previous value is kept.
    pub async fn refresh_with<F, Fut, E>(&self, key: &K, load: F) -> Result<Refresh, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, u64), E>>,
    {
        let slot = self.slot(key).await;
        let Ok(_flight) = slot.refresh.try_lock() else {
            return Ok(Refresh::InFlight);
        };
        let (value, count) = load().await?;
        slot.store(value, count).await;
        Ok(Refresh::Done)
    }

    /// Next `get_with` for `key` reloads regardless of age.
    pub async fn force_refresh(&self, key: &K) {
        self.slot(key).await.force.store(true, Ordering::Release);
    }

    /// Drop every cached value.
    pub async fn invalidate_all(&self) {
        let slots: Vec<Arc<Slot<V>>> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            *slot.entry.write().await = None;
        }
    }

    pub async fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let slots = self.slots.lock().await;
        let slot = slots.get(key)?.clone();
        drop(slots);
        let entry = slot.entry.read().await;
        entry.clone()
    }

    /// Keys holding a value, with the row count they were built from.
    pub async fn counts(&self) -> Vec<(K, u64)> {
        let slots: Vec<(K, Arc<Slot<V>>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let mut out = Vec::new();
        for (key, slot) in slots {
            if let Some(entry) = slot.entry.read().await.as_ref() {
                if entry.data.is_some() {
                    out.push((key, entry.count));
                }
            }
        }
        out
    }

    /// True while any key has a refresh running.
    pub async fn refreshing(&self) -> bool {
        let slots = self.slots.lock().await;
        slots.values().any(|s| s.refresh.try_lock().is_err())
    }
}
