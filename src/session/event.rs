use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Complete,
    Error,
    Ping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::Ping => "ping",
        }
    }
}

/// One progress record of a session.
///
/// On the wire this is a flat JSON object: `type`, `timestamp` and the
/// payload fields side by side, e.g.
/// `{"type":"progress","timestamp":"…","step":"navigate","url":"…"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, mut payload: Map<String, Value>) -> Self {
        // Reserved keys would shadow the envelope once flattened.
        payload.remove("type");
        payload.remove("timestamp");
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn progress(payload: Map<String, Value>) -> Self {
        Self::new(EventKind::Progress, payload)
    }

    pub fn complete(payload: Map<String, Value>) -> Self {
        Self::new(EventKind::Complete, payload)
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        Self::new(EventKind::Error, payload)
    }

    pub fn ping() -> Self {
        Self::new(EventKind::Ping, Map::new())
    }

    /// Adds one payload field, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != "type" && key != "timestamp" {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }

    /// `complete` and `error` end a session's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
