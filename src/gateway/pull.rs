use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, State},
    response::{
        sse::{self, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, Stream};
use log::error;

use crate::session::{Drained, Event, Subscription};

use super::{GatewayState, Observer};

pub const TRANSPORT: &str = "pull";
pub const PROGRESS: &str = "progress";
pub const PING: &str = "ping";

/// One unit of the pull stream: an SSE `event` label plus the serialized event as `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledEvent {
    pub label: &'static str,
    pub event: Event,
}

impl PulledEvent {
    pub fn is_ping(&self) -> bool {
        self.label == PING
    }

    pub fn to_sse(&self) -> serde_json::Result<sse::Event> {
        Ok(sse::Event::default()
            .event(self.label)
            .data(self.event.to_json()?))
    }
}

/// Waits up to `timeout` for the next event.
///
/// Yields the event labelled `progress`, a `ping` when the wait timed out,
/// or `None` once the session has been removed.
pub async fn poll_once(subscription: &mut Subscription, timeout: Duration) -> Option<PulledEvent> {
    match subscription.recv_timeout(timeout).await {
        Drained::Event(event) => Some(PulledEvent {
            label: PROGRESS,
            event,
        }),
        Drained::Empty => Some(PulledEvent {
            label: PING,
            event: Event::ping(),
        }),
        Drained::Closed => None,
    }
}

pub async fn sse_handler(
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> Response {
    match Observer::attach(state.ctx.bus.clone(), &session_id, TRANSPORT) {
        Ok(observer) => Sse::new(event_stream(observer, state.settings.pull_timeout)).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Endless poll loop that stops after relaying a terminal event or when the
/// session is removed. Dropping the stream detaches the observer.
fn event_stream(
    observer: Observer,
    timeout: Duration,
) -> impl Stream<Item = Result<sse::Event, Infallible>> {
    stream::unfold(Some(observer), move |observer| async move {
        let mut observer = observer?;
        loop {
            let pulled = poll_once(observer.subscription(), timeout).await?;
            let terminal = pulled.event.is_terminal();
            match pulled.to_sse() {
                Ok(item) => {
                    let next = if terminal { None } else { Some(observer) };
                    return Some((Ok(item), next));
                }
                Err(e) => {
                    error!("Failed to serialize event: {e}");
                    if terminal {
                        return None;
                    }
                }
            }
        }
    })
}
