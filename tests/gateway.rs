use std::{net::SocketAddr, time::Duration};

use axum::body::{to_bytes, Body};
use futures::StreamExt;
use http::{Request, StatusCode};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

use scoutgate::{
    core::AppContext,
    gateway::{router, GatewaySettings},
    session::Event,
};

fn settings() -> GatewaySettings {
    GatewaySettings {
        push_idle_interval: Duration::from_millis(50),
        pull_timeout: Duration::from_millis(50),
        allow_origins: Vec::new(),
    }
}

async fn serve(ctx: AppContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ctx, settings());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn next_text<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn sse_stream_labels_events_and_ends_on_complete() {
    let ctx = AppContext::default();
    ctx.bus
        .publish("job-1", Event::progress(Map::new()).with("step", "navigate"))
        .unwrap();
    ctx.bus
        .publish("job-1", Event::complete(Map::new()).with("companies", 3))
        .unwrap();

    let response = router(ctx.clone(), settings())
        .oneshot(
            Request::get("/sse/portfolio-scraping/job-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let labels: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(labels, ["progress", "progress"]);

    let data: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(data[0]["type"], "progress");
    assert_eq!(data[0]["step"], "navigate");
    assert_eq!(data[1]["type"], "complete");
    assert_eq!(data[1]["companies"], 3);

    assert_eq!(ctx.bus.sessions()[0].subscribers, 0);
}

#[tokio::test]
async fn sse_emits_ping_while_idle() {
    let ctx = AppContext::default();
    let response = router(ctx.clone(), settings())
        .oneshot(
            Request::get("/sse/portfolio-scraping/quiet")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let mut body = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.contains("event: ping"), "{text}");
    assert!(text.contains(r#""type":"ping""#), "{text}");

    drop(body);
    assert!(ctx.bus.contains("quiet"));
}

#[tokio::test]
async fn websocket_relays_events_and_closes_after_terminal() {
    let ctx = AppContext::default();
    let addr = serve(ctx.clone()).await;
    ctx.bus
        .publish("job-2", Event::progress(Map::new()).with("step", 1))
        .unwrap();

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/portfolio-scraping/job-2"))
        .await
        .unwrap();

    let first = next_text(&mut socket).await;
    assert_eq!(first["type"], "progress");
    assert_eq!(first["step"], 1);

    ctx.bus
        .publish("job-2", Event::progress(Map::new()).with("step", 2))
        .unwrap();
    ctx.bus.publish("job-2", Event::error("blocked")).unwrap();

    assert_eq!(next_text(&mut socket).await["step"], 2);
    let last = next_text(&mut socket).await;
    assert_eq!(last["type"], "error");
    assert_eq!(last["message"], "blocked");

    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
        {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn websocket_disconnect_keeps_session_for_producer() {
    let ctx = AppContext::default();
    let addr = serve(ctx.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/portfolio-scraping/job-3"))
        .await
        .unwrap();
    ctx.bus
        .publish("job-3", Event::progress(Map::new()))
        .unwrap();
    next_text(&mut socket).await;
    socket.close(None).await.unwrap();

    for _ in 0..100 {
        if ctx.bus.sessions()[0].subscribers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.bus.sessions()[0].subscribers, 0);

    // The producer keeps publishing without an observer.
    ctx.bus
        .publish("job-3", Event::complete(Map::new()))
        .unwrap();
    assert_eq!(ctx.bus.sessions()[0].published, 2);
}

#[tokio::test]
async fn invalid_session_id_is_rejected_on_both_transports() {
    let ctx = AppContext::default();
    let addr = serve(ctx.clone()).await;

    assert!(connect_async(format!("ws://{addr}/ws/portfolio-scraping/bad%20id"))
        .await
        .is_err());

    let response = router(ctx.clone(), settings())
        .oneshot(
            Request::get("/sse/portfolio-scraping/%2E%2E%2Fsecret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(ctx.bus.is_empty());
}
