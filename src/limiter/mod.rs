//! Per-source admission control.
//!
//! Every external source (github, reddit, ...) owns an independent token
//! bucket. A bucket starts empty, refills continuously at `refill_rate`
//! tokens per second up to `max_tokens`, and each admitted call consumes one
//! token. Buckets are created lazily on first reference and live until
//! [`RateAdmissionController::reset`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info};
use serde::Serialize;
use tokio::time::{sleep, Instant};

use crate::{
    config::{RateLimit, ReconfigurePolicy, Scout, DEFAULT_SOURCE},
    core::{ScoutError, ScoutResult},
    metrics::ADMISSIONS,
};

/// Static `source -> limit` table with a named fallback entry.
#[derive(Clone, Debug)]
pub struct RateLimitTable {
    limits: HashMap<String, RateLimit>,
    fallback: RateLimit,
}

impl RateLimitTable {
    /// Builds a table; the `default` entry (if present) becomes the fallback.
    pub fn new(mut limits: HashMap<String, RateLimit>) -> Self {
        let fallback = limits.remove(DEFAULT_SOURCE).unwrap_or(RateLimit {
            max_tokens: 10.0,
            refill_rate: 1.0,
        });
        Self { limits, fallback }
    }

    pub fn lookup(&self, source: &str) -> RateLimit {
        self.limits.get(source).copied().unwrap_or(self.fallback)
    }

    /// Metric label for a source; unknown sources collapse onto the fallback name.
    fn label<'a>(&self, source: &'a str) -> &'a str {
        if self.limits.contains_key(source) {
            source
        } else {
            DEFAULT_SOURCE
        }
    }
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self::new(Scout::default_rate_limits())
    }
}

/// Token bucket state for one source.
#[derive(Debug)]
pub struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            tokens: 0.0,
            max_tokens: limit.max_tokens,
            refill_rate: limit.refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instant is monotonic, but a caller may have sampled `now` before
        // another caller advanced last_refill.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available; `None` when the bucket can never
    /// refill, or refills so slowly the wait does not fit in a `Duration`.
    fn wait_time(&self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate).ok()
    }

    fn apply(&mut self, limit: RateLimit) {
        self.max_tokens = limit.max_tokens;
        self.refill_rate = limit.refill_rate;
        self.tokens = self.tokens.min(self.max_tokens);
    }
}

/// Point-in-time view of a bucket, used by the admin API and tests.
#[derive(Clone, Debug, Serialize)]
pub struct BucketSnapshot {
    pub source: String,
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
}

/// Owns the `source -> bucket` map.
///
/// The map only guards insertion; each bucket carries its own lock so that
/// refill-and-consume steps on one source are totally ordered while distinct
/// sources never wait on each other.
pub struct RateAdmissionController {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    table: RateLimitTable,
    policy: ReconfigurePolicy,
}

impl Default for RateAdmissionController {
    fn default() -> Self {
        Self::new(RateLimitTable::default(), ReconfigurePolicy::default())
    }
}

impl RateAdmissionController {
    pub fn new(table: RateLimitTable, policy: ReconfigurePolicy) -> Self {
        Self {
            buckets: DashMap::new(),
            table,
            policy,
        }
    }

    pub fn from_config(cfg: &Scout) -> Self {
        info!(
            "Loading {} rate limit entries (reconfigure policy: {:?})",
            cfg.rate_limits.len(),
            cfg.rate_limits_reconfigure
        );
        Self::new(
            RateLimitTable::new(cfg.rate_limits.clone()),
            cfg.rate_limits_reconfigure,
        )
    }

    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    /// Ensures a bucket exists for `source`.
    ///
    /// A new bucket starts empty. For an existing bucket the limit is applied
    /// only under [`ReconfigurePolicy::Update`].
    pub fn configure(&self, source: &str, limit: RateLimit) {
        let (bucket, created) = self.get_or_create(source, limit);
        if !created && self.policy == ReconfigurePolicy::Update {
            let mut bucket = lock(&bucket);
            bucket.refill(Instant::now());
            bucket.apply(limit);
            debug!("Updated bucket for source {source}: {limit:?}");
        }
    }

    /// Refills the source's bucket and consumes one token if available.
    pub fn try_acquire(&self, source: &str) -> bool {
        let bucket = self.bucket(source);
        let granted = {
            let mut bucket = lock(&bucket);
            bucket.refill(Instant::now());
            bucket.try_take()
        };

        let outcome = if granted { "granted" } else { "denied" };
        ADMISSIONS
            .with_label_values(&[self.table.label(source), outcome])
            .inc();
        if !granted {
            debug!("Admission denied for source {source}");
        }
        granted
    }

    /// Refills the source's bucket and reports how long until a call would be admitted.
    ///
    /// Returns `Some(Duration::ZERO)` when a call is admissible now and `None`
    /// when the bucket is short and has a zero refill rate. The refill step
    /// advances the bucket clock, so this is not a pure read.
    pub fn wait_time(&self, source: &str) -> Option<Duration> {
        let bucket = self.bucket(source);
        let mut bucket = lock(&bucket);
        bucket.refill(Instant::now());
        bucket.wait_time()
    }

    /// Waits until `source` admits a call, then consumes the token.
    pub async fn acquire(&self, source: &str) -> ScoutResult<()> {
        loop {
            if self.try_acquire(source) {
                return Ok(());
            }
            match self.wait_time(source) {
                Some(wait) => sleep(wait.max(Duration::from_millis(1))).await,
                None => return Err(ScoutError::AdmissionUnavailable(source.to_string())),
            }
        }
    }

    /// Drops one bucket, or every bucket when `source` is `None`.
    pub fn reset(&self, source: Option<&str>) {
        match source {
            Some(source) => {
                if self.buckets.remove(source).is_some() {
                    debug!("Reset bucket for source {source}");
                }
            }
            None => {
                info!("Resetting {} buckets", self.buckets.len());
                self.buckets.clear();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let mut snapshots: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let bucket = lock(entry.value());
                BucketSnapshot {
                    source: entry.key().clone(),
                    tokens: bucket.tokens,
                    max_tokens: bucket.max_tokens,
                    refill_rate: bucket.refill_rate,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.source.cmp(&b.source));
        snapshots
    }

    fn bucket(&self, source: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.get(source) {
            return bucket.value().clone();
        }
        self.get_or_create(source, self.table.lookup(source)).0
    }

    fn get_or_create(&self, source: &str, limit: RateLimit) -> (Arc<Mutex<Bucket>>, bool) {
        let mut created = false;
        let bucket = self
            .buckets
            .entry(source.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Bucket::new(limit, Instant::now())))
            })
            .value()
            .clone();

        if created {
            debug!(
                "Created bucket for source {source}: max_tokens={}, refill_rate={}",
                limit.max_tokens, limit.refill_rate
            );
        }
        (bucket, created)
    }
}

fn lock(bucket: &Mutex<Bucket>) -> MutexGuard<'_, Bucket> {
    // A panic while holding the lock cannot leave the bucket half-updated.
    bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
