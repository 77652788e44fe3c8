//! TTL-keyed store for results of idempotent, expensive calls.
//!
//! Expiry is lazy: an entry whose TTL has lapsed stays in the map until the
//! next read of its key (or a `clear`), there is no background sweep.

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use log::{debug, trace, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    config,
    core::ScoutResult,
    metrics::CACHE_LOOKUPS,
};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Stand-in expiry for ttls too large to add to an `Instant`, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deterministic cache key for a logical call.
///
/// The key is `"{prefix}:{sha256}"` where the digest covers the prefix, the
/// positional arguments and the keyword arguments sorted by name. The literal
/// prefix is kept in clear so entries can be cleared per namespace.
pub fn fingerprint(prefix: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let mut sorted: Vec<(&String, &Value)> = kwargs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let kwargs: Vec<Value> = sorted
        .into_iter()
        .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), canonical(v)]))
        .collect();

    let material = Value::Array(vec![
        Value::String(prefix.to_string()),
        Value::Array(args.iter().map(canonical).collect()),
        Value::Array(kwargs),
    ]);

    let digest = Sha256::digest(material.to_string().as_bytes());
    format!("{prefix}:{digest:x}")
}

/// Fingerprint of a serializable input struct, its fields acting as keyword arguments.
pub fn fingerprint_of<T: Serialize>(prefix: &str, input: &T) -> ScoutResult<String> {
    match serde_json::to_value(input)? {
        Value::Object(fields) => Ok(fingerprint(prefix, &[], &fields)),
        other => Ok(fingerprint(prefix, &[other], &Map::new())),
    }
}

// Object key order must not leak into the digest.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let created_at = Instant::now();
        // Oversized ttls (e.g. `Duration::MAX` for "forever") saturate.
        let expires_at = created_at
            .checked_add(ttl)
            .unwrap_or_else(|| created_at + FAR_FUTURE);
        Self {
            value,
            created_at,
            expires_at,
        }
    }

    /// Servable iff `now <= expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub approx_memory_bytes: usize,
}

enum Lookup {
    Hit(Value),
    Miss,
    Expired,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    default_ttl: Duration,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            default_ttl,
        }
    }

    pub fn from_config(cfg: &config::Cache) -> Self {
        Self::new(Duration::from_secs(cfg.default_ttl))
    }

    /// Returns the stored value if it has not expired; an expired entry is removed.
    pub fn get(&self, key: &str) -> Option<Value> {
        let outcome = self.lookup(key);
        let label = match outcome {
            Lookup::Hit(_) => "hit",
            Lookup::Miss => "miss",
            Lookup::Expired => "expired",
        };
        CACHE_LOOKUPS.with_label_values(&[label]).inc();

        match outcome {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Expired => None,
        }
    }

    /// Inserts or overwrites `key`; `ttl` falls back to the configured default.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        trace!("Caching {key} for {}s", ttl.as_secs_f64());
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Removes every entry, or only those whose key starts with `prefix`.
    /// Returns how many entries were removed.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let removed = match prefix {
            None => {
                let count = self.entries.len();
                self.entries.clear();
                count
            }
            Some(prefix) => {
                let mut count = 0;
                self.entries.retain(|key, _| {
                    let matched = key.starts_with(prefix);
                    if matched {
                        count += 1;
                    }
                    !matched
                });
                count
            }
        };
        debug!("Cleared {removed} cache entries (prefix: {prefix:?})");
        removed
    }

    /// Scans every entry; expired entries that were never re-read are counted, not purged.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut stats = CacheStats {
            total: 0,
            active: 0,
            expired: 0,
            approx_memory_bytes: 0,
        };
        for entry in self.entries.iter() {
            stats.total += 1;
            if entry.value().is_expired(now) {
                stats.expired += 1;
            } else {
                stats.active += 1;
            }
            stats.approx_memory_bytes += entry.key().len() + entry.value().value.to_string().len();
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached result for `key`, or runs `op`, stores its result and returns it.
    ///
    /// Concurrent misses on the same key are serialized: the first caller runs
    /// `op`, the others wait and then read its result. Failed operations are
    /// not cached.
    pub async fn memoize<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, op: F) -> ScoutResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScoutResult<T>>,
    {
        if let Some(hit) = self.get_typed(key) {
            return Ok(hit);
        }

        // Locals drop in reverse order: the lock, then our gate handle, then
        // the cleanup that can see whether we were the last holder.
        let _cleanup = GateCleanup {
            gates: &self.in_flight,
            key,
        };
        let gate = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _held = gate.lock().await;
        // Another caller may have filled the entry while we waited.
        match self.peek_typed(key) {
            Some(hit) => Ok(hit),
            None => self.fill(key, ttl, op).await,
        }
    }

    /// Like [`ResultCache::memoize`] without the per-key gate: concurrent
    /// misses may each run their operation, the last writer wins.
    pub async fn memoize_relaxed<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        op: F,
    ) -> ScoutResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScoutResult<T>>,
    {
        match self.get_typed(key) {
            Some(hit) => Ok(hit),
            None => self.fill(key, ttl, op).await,
        }
    }

    async fn fill<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, op: F) -> ScoutResult<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScoutResult<T>>,
    {
        let result = op().await?;
        self.set(key, serde_json::to_value(&result)?, ttl);
        Ok(result)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| decode(key, value))
    }

    fn peek_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup(key) {
            Lookup::Hit(value) => decode(key, value),
            Lookup::Miss | Lookup::Expired => None,
        }
    }

    fn lookup(&self, key: &str) -> Lookup {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                return Lookup::Miss;
            };
            if !entry.is_expired(now) {
                return Lookup::Hit(entry.value.clone());
            }
        }
        // Re-check under the shard lock so a concurrent `set` is not discarded.
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            trace!("Purged expired cache entry {key}");
        }
        Lookup::Expired
    }
}

/// Drops a key's fill gate once no caller holds it, including callers whose
/// future was cancelled mid-fill.
struct GateCleanup<'a> {
    gates: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
}

impl Drop for GateCleanup<'_> {
    fn drop(&mut self) {
        self.gates
            .remove_if(self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!("Cached value for {key} does not match the requested type: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_respects_ttl_boundary() {
        let cache = ResultCache::default();
        cache.set("k", json!({"a": 1}), Some(Duration::from_secs(1)));
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), Some(json!({"a": 1})), "now == expires_at is servable");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty(), "expired read purges the entry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let cache = ResultCache::new(Duration::from_secs(10));
        cache.set("k", json!(1), None);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_counts_unpurged_expired() {
        let cache = ResultCache::default();
        cache.set("short", json!("x"), Some(Duration::from_secs(1)));
        cache.set("long", json!("y"), Some(Duration::from_secs(100)));
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = cache.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.expired, 1);
        assert!(stats.approx_memory_bytes > 0);

        assert!(cache.get("short").is_none());
        assert_eq!(cache.stats().total, 1);
    }

    #[test]
    fn test_clear_with_prefix() {
        let cache = ResultCache::default();
        cache.set("github:1", json!(1), None);
        cache.set("github:2", json!(2), None);
        cache.set("reddit:1", json!(3), None);

        assert_eq!(cache.clear(Some("github:")), 2);
        assert!(cache.get("reddit:1").is_some());
        assert_eq!(cache.clear(Some("nothing")), 0);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_overwrites() {
        let cache = ResultCache::default();
        cache.set("k", json!(1), None);
        cache.set("k", json!(2), None);
        assert_eq!(cache.get("k"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let mut a = Map::new();
        a.insert("org".into(), json!("acme"));
        a.insert("page".into(), json!(2));
        let mut b = Map::new();
        b.insert("page".into(), json!(2));
        b.insert("org".into(), json!("acme"));

        let k1 = fingerprint("github", &[json!("stats")], &a);
        let k2 = fingerprint("github", &[json!("stats")], &b);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("github:"));
        assert_eq!(k1.len(), "github:".len() + 64);

        assert_ne!(k1, fingerprint("github", &[json!("repos")], &a));
        assert_ne!(k1, fingerprint("reddit", &[json!("stats")], &a));
        assert_ne!(
            fingerprint("p", &[json!(1), json!(2)], &Map::new()),
            fingerprint("p", &[json!(2), json!(1)], &Map::new())
        );
    }

    #[test]
    fn test_fingerprint_of_struct() {
        #[derive(Serialize)]
        struct Lookup<'a> {
            org: &'a str,
            page: u32,
        }
        let key = fingerprint_of("github", &Lookup { org: "acme", page: 1 }).unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("page".into(), json!(1));
        kwargs.insert("org".into(), json!("acme"));
        assert_eq!(key, fingerprint("github", &[], &kwargs));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Stars {
        count: u64,
    }

    #[tokio::test(start_paused = true)]
    async fn test_memoize_hits_within_ttl() {
        let cache = ResultCache::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let stars: Stars = cache
                .memoize("github:acme", Some(Duration::from_secs(60)), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Stars { count: 42 })
                })
                .await
                .unwrap();
            assert_eq!(stars, Stars { count: 42 });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let _: Stars = cache
            .memoize("github:acme", Some(Duration::from_secs(60)), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Stars { count: 43 })
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memoize_does_not_cache_errors() {
        let cache = ResultCache::default();
        let res: ScoutResult<Stars> = cache
            .memoize("k", None, || async {
                Err(crate::core::ScoutError::Worker("timeout".into()))
            })
            .await;
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_memoize_single_flight() {
        let cache = Arc::new(ResultCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .memoize("slow", None, || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Stars { count: 7 })
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Stars { count: 7 });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_memoize_releases_gate() {
        let cache = ResultCache::default();
        let holder = cache.memoize("stuck", None, || std::future::pending::<ScoutResult<Stars>>());
        let waiter = cache.memoize("stuck", None, || async { Ok(Stars { count: 1 }) });

        let raced = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(holder, waiter)
        })
        .await;
        assert!(raced.is_err());
        assert!(cache.in_flight.is_empty());

        let stars = cache
            .memoize("stuck", None, || async { Ok(Stars { count: 2 }) })
            .await
            .unwrap();
        assert_eq!(stars, Stars { count: 2 });
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_saturates() {
        let cache = ResultCache::default();
        cache.set("forever", json!(1), Some(Duration::MAX));
        let stars = cache
            .memoize("forever-typed", Some(Duration::MAX), || async {
                Ok(Stars { count: 3 })
            })
            .await
            .unwrap();
        assert_eq!(stars, Stars { count: 3 });

        tokio::time::advance(Duration::from_secs(86400 * 365)).await;
        assert_eq!(cache.get("forever"), Some(json!(1)));
        assert_eq!(cache.stats().active, 2);
    }

    #[tokio::test]
    async fn test_memoize_relaxed_may_run_twice() {
        let cache = Arc::new(ResultCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    cache
                        .memoize_relaxed("racy", None, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            barrier.wait().await;
                            Ok(Stars { count: 1 })
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
