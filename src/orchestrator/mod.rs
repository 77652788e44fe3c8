//! Coordination of one scraping job: admission, memoized fetch, persistence
//! and progress reporting.
//!
//! The fetching itself lives behind [`Worker`], persistence behind
//! [`Storage`]; both are supplied by the embedding application.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value};

use crate::{
    cache::fingerprint,
    core::{AppContext, ScoutError, ScoutResult},
    session::{validate_session_id, Event, SessionEventBus},
};

/// One idempotent external lookup.
#[derive(Debug, Clone, Default)]
pub struct WorkUnit {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Cache lifetime; the cache default applies when unset.
    pub ttl: Option<Duration>,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache key, namespaced `"{source}:{name}:"` so a source can be cleared by prefix.
    pub fn cache_key(&self, source: &str) -> String {
        fingerprint(&format!("{source}:{}", self.name), &self.args, &self.kwargs)
    }
}

/// Lets a worker publish its own intermediate progress.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<SessionEventBus>,
    session_id: String,
}

impl ProgressReporter {
    pub fn new(bus: Arc<SessionEventBus>, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn report(&self, payload: Map<String, Value>) {
        self.emit(Event::progress(payload));
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.bus.publish(&self.session_id, event) {
            warn!("Dropping progress for session {}: {e}", self.session_id);
        }
    }
}

/// Performs the external fetch once admission has been granted.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Rate-limit source this worker calls, e.g. `"github"`.
    fn source(&self) -> &str;

    async fn fetch(&self, unit: &WorkUnit, progress: &ProgressReporter) -> ScoutResult<Value>;
}

/// Persists fetched results, deduplicated by `key`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn persist(&self, key: &str, value: &Value) -> ScoutResult<()>;
}

pub struct Orchestrator {
    ctx: AppContext,
    storage: Option<Arc<dyn Storage>>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx, storage: None }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Runs one unit: cache lookup, then on miss admission wait, fetch,
    /// persist and cache fill. Publishes one progress event on success.
    pub async fn run_unit(
        &self,
        session_id: &str,
        worker: &dyn Worker,
        unit: &WorkUnit,
    ) -> ScoutResult<Value> {
        let source = worker.source();
        let key = unit.cache_key(source);
        let progress = ProgressReporter::new(self.ctx.bus.clone(), session_id);
        let fetched = AtomicBool::new(false);

        let value: Value = self
            .ctx
            .cache
            .memoize(&key, unit.ttl, || async {
                self.ctx.limiter.acquire(source).await?;
                fetched.store(true, Ordering::Relaxed);
                let value = worker.fetch(unit, &progress).await?;
                if let Some(storage) = &self.storage {
                    storage
                        .persist(&key, &value)
                        .await
                        .map_err(|e| match e {
                            ScoutError::Storage(_) => e,
                            other => ScoutError::Storage(format!("{key}: {other}")),
                        })?;
                }
                Ok(value)
            })
            .await?;

        let cached = !fetched.load(Ordering::Relaxed);
        debug!(
            "Unit {} for {source} done ({})",
            unit.name,
            if cached { "cached" } else { "fetched" }
        );
        progress.emit(
            Event::progress(Map::new())
                .with("source", source)
                .with("unit", unit.name.as_str())
                .with("cached", cached),
        );
        Ok(value)
    }

    /// Runs every unit in order and closes the session's stream with a
    /// `complete` event, or an `error` event on the first failure.
    pub async fn run_job(
        &self,
        session_id: &str,
        worker: &dyn Worker,
        units: &[WorkUnit],
    ) -> ScoutResult<Vec<Value>> {
        validate_session_id(session_id)?;
        let progress = ProgressReporter::new(self.ctx.bus.clone(), session_id);
        progress.emit(
            Event::progress(Map::new())
                .with("step", "start")
                .with("source", worker.source())
                .with("total", units.len()),
        );

        let mut results = Vec::with_capacity(units.len());
        for unit in units {
            match self.run_unit(session_id, worker, unit).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!("Job {session_id} failed on {}: {e}", unit.name);
                    progress.emit(Event::error(e.to_string()).with("unit", unit.name.as_str()));
                    return Err(e);
                }
            }
        }

        progress.emit(Event::complete(Map::new()).with("total", results.len()));
        Ok(results)
    }
}
