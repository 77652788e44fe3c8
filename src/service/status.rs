use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{config::Status, core::status, utils::response::ResponseBuilder};

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Readiness probe, kept off the admin listener so it needs no api key.
///
/// `GET /status/ready` answers 200 `{"status":"ok"}` once the streaming
/// gateway listener is bound, 503 otherwise.
pub struct StatusHttpApp {
    config: Status,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status) -> Self {
        Self {
            config: cfg.clone(),
        }
    }

    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let app = Self::new(cfg);
        let addr = app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(&addr);
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        route(http_session.req_header().uri.path())
    }
}

fn route(path: &str) -> Response<Vec<u8>> {
    match path {
        "/status/ready" => readiness(),
        _ => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn readiness() -> Response<Vec<u8>> {
    if status::is_ready() {
        ResponseBuilder::json(
            StatusCode::OK,
            &StatusResponse {
                status: "ok",
                error: None,
            },
        )
    } else {
        ResponseBuilder::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &StatusResponse {
                status: "error",
                error: Some("Streaming gateway not bound yet"),
            },
        )
    }
}
