use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    config,
    core::{ScoutError, ScoutResult},
    metrics::{EVENTS_PUBLISHED, SESSIONS},
};

use super::event::Event;

pub const MAX_SESSION_ID_LEN: usize = 128;
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

static SESSION_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

pub fn validate_session_id(id: &str) -> ScoutResult<()> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN || !SESSION_ID.is_match(id) {
        return Err(ScoutError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// Outcome of waiting on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Drained {
    Event(Event),
    /// Nothing arrived within the timeout.
    Empty,
    /// The session was torn down and everything buffered has been read.
    Closed,
}

/// A single observer's queue on one session.
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    id: Uuid,
    rx: UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits up to `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Drained {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Drained::Event(event),
            Ok(None) => Drained::Closed,
            Err(_) => Drained::Empty,
        }
    }

    /// Waits without bound; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Drained {
        match self.rx.try_recv() {
            Ok(event) => Drained::Event(event),
            Err(TryRecvError::Empty) => Drained::Empty,
            Err(TryRecvError::Disconnected) => Drained::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub subscribers: usize,
    pub buffered: usize,
    pub published: u64,
    pub finished: bool,
}

struct Session {
    history: VecDeque<Event>,
    subscribers: HashMap<Uuid, UnboundedSender<Event>>,
    published: u64,
    created_at: Instant,
    finished_at: Option<Instant>,
}

impl Session {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: HashMap::new(),
            published: 0,
            created_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Finished, or opened by an observer that no producer ever joined, at
    /// least `linger` ago.
    fn is_stale(&self, now: Instant, linger: Duration) -> bool {
        match self.finished_at {
            Some(at) => now.duration_since(at) >= linger,
            None => self.published == 0 && now.duration_since(self.created_at) >= linger,
        }
    }

    fn live_subscribers(&mut self) -> usize {
        self.subscribers.retain(|_, tx| !tx.is_closed());
        self.subscribers.len()
    }
}

/// Per-session ordered event fan-out.
///
/// Every subscriber owns a queue. `publish` appends to a bounded replay
/// history and pushes a copy to each attached queue; a late subscriber first
/// receives the retained history, then live events, in publish order.
pub struct SessionEventBus {
    sessions: DashMap<String, Session>,
    history_limit: usize,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SessionEventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn from_config(cfg: &config::Sessions) -> Self {
        Self::new(cfg.history_limit)
    }

    /// Appends `event` to the session, creating it if absent. Never waits on observers.
    pub fn publish(&self, session_id: &str, event: Event) -> ScoutResult<()> {
        validate_session_id(session_id)?;
        EVENTS_PUBLISHED
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let created = {
            let mut created = false;
            let mut session = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    created = true;
                    Session::new()
                });

            if event.is_terminal() && session.finished_at.is_none() {
                session.finished_at = Some(Instant::now());
                debug!("Session {session_id} finished with a {} event", event.kind.as_str());
            }

            // Closed receivers are pruned here.
            session
                .subscribers
                .retain(|_, tx| tx.send(event.clone()).is_ok());

            session.history.push_back(event);
            while session.history.len() > self.history_limit {
                session.history.pop_front();
            }
            session.published += 1;
            trace!(
                "Published event #{} to session {session_id} ({} observers)",
                session.published,
                session.subscribers.len()
            );
            created
        };

        if created {
            info!("Session {session_id} created by producer");
            self.update_gauge();
        }
        Ok(())
    }

    /// Attaches a new observer, creating the session if absent.
    /// The returned queue is pre-loaded with the retained history.
    pub fn subscribe(&self, session_id: &str) -> ScoutResult<Subscription> {
        validate_session_id(session_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let created = {
            let mut created = false;
            let mut session = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    created = true;
                    Session::new()
                });
            for event in session.history.iter() {
                // The receiver is alive in this scope.
                let _ = tx.send(event.clone());
            }
            session.subscribers.insert(id, tx);
            created
        };

        if created {
            info!("Session {session_id} created by observer");
            self.update_gauge();
        }
        debug!("Observer {id} attached to session {session_id}");
        Ok(Subscription {
            session_id: session_id.to_string(),
            id,
            rx,
        })
    }

    /// Waits up to `timeout` for the next event on `subscription`.
    pub async fn drain(&self, subscription: &mut Subscription, timeout: Duration) -> Drained {
        subscription.recv_timeout(timeout).await
    }

    pub fn try_drain(&self, subscription: &mut Subscription) -> Drained {
        subscription.try_recv()
    }

    /// Detaches one observer; the session and its other observers are untouched.
    pub fn detach(&self, subscription: &Subscription) {
        if let Some(mut session) = self.sessions.get_mut(subscription.session_id()) {
            if session.subscribers.remove(&subscription.id).is_some() {
                debug!(
                    "Observer {} detached from session {}",
                    subscription.id,
                    subscription.session_id()
                );
            }
        }
    }

    /// Tears the whole session down, dropping its history. Idempotent.
    ///
    /// Attached observers see [`Drained::Closed`] once they have read what was
    /// already in their queue.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!("Session {session_id} removed");
            self.update_gauge();
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter_mut()
            .map(|mut entry| {
                let subscribers = entry.live_subscribers();
                SessionSummary {
                    id: entry.key().clone(),
                    subscribers,
                    buffered: entry.history.len(),
                    published: entry.published,
                    finished: entry.finished_at.is_some(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Removes stale sessions that have no live observer: those that
    /// finished at least `linger` ago, and those no producer has published to
    /// within `linger` of their creation.
    pub fn reap(&self, linger: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let keep = !session.is_stale(now, linger) || session.live_subscribers() > 0;
            if !keep {
                info!("Reaping stale session {id}");
            }
            keep
        });
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            self.update_gauge();
        }
        reaped
    }

    fn update_gauge(&self) {
        SESSIONS.set(self.sessions.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn step(n: u64) -> Event {
        Event::progress(Map::new()).with("step", n)
    }

    fn step_of(drained: Drained) -> u64 {
        match drained {
            Drained::Event(e) => e.payload["step"].as_u64().unwrap(),
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id("job-42_a.b").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("white space").is_err());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_LEN)).is_ok());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());

        let bus = SessionEventBus::default();
        assert!(matches!(
            bus.publish("../etc", step(1)),
            Err(ScoutError::InvalidSessionId(_))
        ));
        assert!(bus.subscribe("").is_err());
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_single_consumer_sees_publish_order() {
        let bus = SessionEventBus::default();
        let mut sub = bus.subscribe("s1").unwrap();
        for n in 1..=3 {
            bus.publish("s1", step(n)).unwrap();
        }
        for n in 1..=3 {
            assert_eq!(step_of(bus.drain(&mut sub, Duration::from_millis(10)).await), n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_empty_returns_sentinel() {
        let bus = SessionEventBus::default();
        let mut sub = bus.subscribe("idle").unwrap();
        let started = Instant::now();
        assert_eq!(bus.drain(&mut sub, Duration::from_secs(1)).await, Drained::Empty);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(bus.try_drain(&mut sub), Drained::Empty);
    }

    #[tokio::test]
    async fn test_publish_before_subscribe_is_replayed() {
        let bus = SessionEventBus::default();
        bus.publish("early", step(1)).unwrap();
        bus.publish("early", step(2)).unwrap();

        let mut sub = bus.subscribe("early").unwrap();
        bus.publish("early", step(3)).unwrap();
        for n in 1..=3 {
            assert_eq!(step_of(sub.try_recv()), n);
        }
    }

    #[test]
    fn test_every_observer_gets_full_stream() {
        let bus = SessionEventBus::default();
        let mut a = bus.subscribe("s").unwrap();
        bus.publish("s", step(1)).unwrap();
        let mut b = bus.subscribe("s").unwrap();
        bus.publish("s", step(2)).unwrap();

        for sub in [&mut a, &mut b] {
            assert_eq!(step_of(sub.try_recv()), 1);
            assert_eq!(step_of(sub.try_recv()), 2);
            assert_eq!(sub.try_recv(), Drained::Empty);
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = SessionEventBus::new(2);
        for n in 1..=5 {
            bus.publish("s", step(n)).unwrap();
        }
        let mut sub = bus.subscribe("s").unwrap();
        assert_eq!(step_of(sub.try_recv()), 4);
        assert_eq!(step_of(sub.try_recv()), 5);
        assert_eq!(sub.try_recv(), Drained::Empty);
    }

    #[test]
    fn test_detach_keeps_session() {
        let bus = SessionEventBus::default();
        let a = bus.subscribe("s").unwrap();
        let mut b = bus.subscribe("s").unwrap();
        bus.detach(&a);
        bus.publish("s", step(1)).unwrap();

        assert!(bus.contains("s"));
        assert_eq!(step_of(b.try_recv()), 1);
        assert_eq!(bus.sessions()[0].subscribers, 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_closes() {
        let bus = SessionEventBus::default();
        let mut sub = bus.subscribe("s").unwrap();
        bus.publish("s", step(1)).unwrap();

        assert!(bus.unsubscribe("s"));
        assert!(!bus.unsubscribe("s"));
        assert!(!bus.unsubscribe("never-existed"));

        assert_eq!(step_of(sub.try_recv()), 1);
        assert_eq!(sub.try_recv(), Drained::Closed);

        // A fresh subscribe starts an empty session.
        let mut again = bus.subscribe("s").unwrap();
        assert_eq!(again.try_recv(), Drained::Empty);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = SessionEventBus::default();
        drop(bus.subscribe("s").unwrap());
        assert_eq!(bus.sessions()[0].subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_finished_sessions_after_linger() {
        let bus = SessionEventBus::default();
        bus.publish("done", step(1)).unwrap();
        bus.publish("done", Event::complete(Map::new())).unwrap();
        bus.publish("running", step(1)).unwrap();
        let watched = bus.subscribe("watched").unwrap();
        bus.publish("watched", Event::error("blocked")).unwrap();

        assert_eq!(bus.reap(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bus.reap(Duration::from_secs(60)), 1);

        assert!(!bus.contains("done"));
        assert!(bus.contains("running"));
        assert!(bus.contains("watched"));

        drop(watched);
        assert_eq!(bus.reap(Duration::from_secs(60)), 1);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_sessions_no_producer_joined() {
        let bus = SessionEventBus::default();
        drop(bus.subscribe("drive-by").unwrap());
        let waiting = bus.subscribe("waiting").unwrap();
        drop(bus.subscribe("joined").unwrap());
        bus.publish("joined", step(1)).unwrap();

        assert_eq!(bus.reap(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bus.reap(Duration::from_secs(60)), 1);

        assert!(!bus.contains("drive-by"));
        assert!(bus.contains("waiting"), "an attached observer keeps it");
        assert!(bus.contains("joined"), "a producer owns it now");

        bus.detach(&waiting);
        assert_eq!(bus.reap(Duration::from_secs(60)), 1);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_summaries() {
        let bus = SessionEventBus::default();
        bus.publish("b", step(1)).unwrap();
        bus.publish("a", Event::complete(Map::new())).unwrap();
        let summaries = bus.sessions();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "a");
        assert!(summaries[0].finished);
        assert_eq!(summaries[1].published, 1);
        assert!(!summaries[1].finished);
        assert_eq!(summaries[1].buffered, 1);
    }
}
