use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use log::{debug, error};
use tokio::time::{interval_at, Instant};

use super::{GatewayState, Observer};

pub const TRANSPORT: &str = "push";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> Response {
    let observer = match Observer::attach(state.ctx.bus.clone(), &session_id, TRANSPORT) {
        Ok(observer) => observer,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| stream_session(socket, observer, state))
}

/// Forwards every session event as one text frame holding the event JSON.
///
/// The socket closes after a terminal event or once the session is removed.
/// A ping frame goes out whenever nothing was sent for the idle interval.
async fn stream_session(socket: WebSocket, mut observer: Observer, state: GatewayState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let idle = state.settings.push_idle_interval;
    let mut keep_alive = interval_at(Instant::now() + idle, idle);

    let reason = loop {
        tokio::select! {
            next = observer.subscription().recv() => {
                let Some(event) = next else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break "session removed";
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize event: {e}");
                        break "serialization failure";
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break "send failed";
                }
                if event.is_terminal() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break "session finished";
                }
                keep_alive.reset();
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break "observer disconnected",
                    // Observers have nothing to say on this channel.
                    Some(Ok(_)) => {}
                }
            }
            _ = keep_alive.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "ping failed";
                }
            }
        }
    };

    debug!(
        "Push stream for session {} ended: {reason}",
        observer.subscription().session_id()
    );
}
