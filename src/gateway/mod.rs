//! Delivery of session events to external observers.
//!
//! Two transports share one router: a WebSocket push channel and an SSE pull
//! channel. The router runs on its own listener inside a pingora background
//! service so it shares the server's lifecycle and shutdown signal.

pub mod pull;
pub mod push;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info, warn};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    config,
    core::{status, AppContext, ScoutError},
    metrics::ObserverGuard,
    session::{SessionEventBus, Subscription},
};

pub const PUSH_PATH: &str = "/ws/portfolio-scraping/{session_id}";
pub const PULL_PATH: &str = "/sse/portfolio-scraping/{session_id}";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Quiet period after which the push transport sends a ping frame.
    pub push_idle_interval: Duration,
    /// How long one pull poll waits before yielding a `ping`.
    pub pull_timeout: Duration,
    pub allow_origins: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&config::Gateway::default())
    }
}

impl From<&config::Gateway> for GatewaySettings {
    fn from(cfg: &config::Gateway) -> Self {
        Self {
            push_idle_interval: Duration::from_millis(cfg.push_idle_interval_ms),
            pull_timeout: Duration::from_millis(cfg.pull_timeout_ms),
            allow_origins: cfg.allow_origins.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub ctx: AppContext,
    pub settings: Arc<GatewaySettings>,
}

pub fn router(ctx: AppContext, settings: GatewaySettings) -> Router {
    let cors = cors_layer(&settings.allow_origins);
    let state = GatewayState {
        ctx,
        settings: Arc::new(settings),
    };

    Router::new()
        .route("/health", get(health))
        .route(PUSH_PATH, get(push::ws_handler))
        .route(PULL_PATH, get(pull::sse_handler))
        .with_state(state)
        .layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin {origin:?}: {e}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.ctx.bus.len(),
    }))
}

/// Rejection for requests that cannot be attached to a session.
pub struct GatewayError(pub ScoutError);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ScoutError::InvalidSessionId(_) | ScoutError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<ScoutError> for GatewayError {
    fn from(err: ScoutError) -> Self {
        GatewayError(err)
    }
}

/// An attached observer. Dropping it detaches the subscription from its
/// session, whichever way the transport ended.
pub struct Observer {
    subscription: Subscription,
    bus: Arc<SessionEventBus>,
    transport: &'static str,
    _guard: ObserverGuard,
}

impl Observer {
    pub fn attach(
        bus: Arc<SessionEventBus>,
        session_id: &str,
        transport: &'static str,
    ) -> Result<Self, GatewayError> {
        let subscription = bus.subscribe(session_id)?;
        info!(
            "{transport} observer {} connected to session {session_id}",
            subscription.id()
        );
        Ok(Self {
            subscription,
            bus,
            transport,
            _guard: ObserverGuard::new(transport),
        })
    }

    pub fn subscription(&mut self) -> &mut Subscription {
        &mut self.subscription
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.bus.detach(&self.subscription);
        info!(
            "{} observer {} left session {}",
            self.transport,
            self.subscription.id(),
            self.subscription.session_id()
        );
    }
}

/// Serves the gateway router until pingora signals shutdown.
pub struct StreamingGateway {
    address: SocketAddr,
    ctx: AppContext,
    settings: GatewaySettings,
}

impl StreamingGateway {
    pub fn new(address: SocketAddr, ctx: AppContext, settings: GatewaySettings) -> Self {
        Self {
            address,
            ctx,
            settings,
        }
    }

    pub fn from_config(cfg: &config::Gateway, ctx: AppContext) -> Self {
        Self::new(cfg.address, ctx, GatewaySettings::from(cfg))
    }
}

#[async_trait]
impl BackgroundService for StreamingGateway {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind streaming gateway on {}: {e}", self.address);
                return;
            }
        };
        match listener.local_addr() {
            Ok(addr) => status::mark_ready(&addr),
            Err(e) => warn!("Streaming gateway has no local address: {e}"),
        }

        let app = router(self.ctx.clone(), self.settings.clone());
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;

        status::mark_unready();
        match served {
            Ok(()) => info!("Streaming gateway stopped"),
            Err(e) => error!("Streaming gateway failed: {e}"),
        }
    }
}
