//! Control surface for out-of-process workers and operators.
//!
//! Every request must carry the configured `x-api-key`.
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | GET | `/admission` | bucket snapshots |
//! | POST | `/admission/{source}/acquire` | `try_acquire`, `{"permitted","wait_seconds"}` |
//! | GET | `/admission/{source}/wait` | `{"wait_seconds"}`, `null` meaning never |
//! | DELETE | `/admission/{source}`, `/admission` | reset one or all buckets |
//! | GET | `/cache/stats` | cache statistics |
//! | DELETE | `/cache?prefix=` | clear, `{"removed"}` |
//! | GET | `/sessions` | session summaries |
//! | POST | `/sessions/{id}/events` | publish a JSON event, 202 |
//! | DELETE | `/sessions/{id}` | tear a session down |

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use http::{header, HeaderValue, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Admin,
    core::{AppContext, ScoutError, ScoutResult},
    session::Event,
    utils::response::{content_type, ResponseBuilder},
};

type HandlerResult = ScoutResult<Response<Vec<u8>>>;

/// The parts of an admin request a handler needs.
#[derive(Debug, Default)]
pub struct AdminRequest {
    pub params: BTreeMap<String, String>,
    pub query: Option<String>,
    pub body: Vec<u8>,
}

impl AdminRequest {
    fn param(&self, name: &str) -> ScoutResult<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ScoutError::Validation(format!("Missing path parameter {name}")))
    }
}

#[async_trait]
trait Handler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult;
}

pub struct AdminHttpApp {
    ctx: AppContext,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,

    config: Admin,
}

impl AdminHttpApp {
    pub fn new(cfg: &Admin, ctx: AppContext) -> Self {
        let mut this = Self {
            ctx,
            router: Router::new(),
            config: cfg.clone(),
        };

        this.route("/admission", Method::GET, Box::new(BucketListHandler))
            .route("/admission", Method::DELETE, Box::new(ResetHandler))
            .route("/admission/{source}", Method::DELETE, Box::new(ResetHandler))
            .route(
                "/admission/{source}/acquire",
                Method::POST,
                Box::new(AcquireHandler),
            )
            .route("/admission/{source}/wait", Method::GET, Box::new(WaitHandler))
            .route("/cache", Method::DELETE, Box::new(CacheClearHandler))
            .route("/cache/stats", Method::GET, Box::new(CacheStatsHandler))
            .route("/sessions", Method::GET, Box::new(SessionListHandler))
            .route("/sessions/{id}", Method::DELETE, Box::new(SessionDeleteHandler))
            .route(
                "/sessions/{id}/events",
                Method::POST,
                Box::new(PublishHandler),
            );

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to register admin route {path}: {e}");
                }
            }
        }
        self
    }

    pub fn admin_http_service(cfg: &Admin, ctx: AppContext) -> Service<Self> {
        let app = Self::new(cfg, ctx);
        let addr = app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(&addr);
        service
    }

    /// Routes one request to its handler.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        mut req: AdminRequest,
    ) -> Response<Vec<u8>> {
        match self.router.at(path) {
            Ok(Match { value, params }) => match value.get(method) {
                Some(handler) => {
                    req.params = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    match handler.handle(&self.ctx, req).await {
                        Ok(resp) => resp,
                        Err(e) => ResponseBuilder::error_http(error_status(&e), &e.to_string()),
                    }
                }
                None => ResponseBuilder::empty(StatusCode::METHOD_NOT_ALLOWED),
            },
            Err(_) => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if !authorized(http_session.get_header("x-api-key"), &self.config.api_key) {
            return ResponseBuilder::error_http(StatusCode::FORBIDDEN, "Must provide api key");
        }

        let (path, method, query) = {
            let req_header = http_session.req_header();
            (
                req_header.uri.path().to_string(),
                req_header.method.clone(),
                req_header.uri.query().map(str::to_string),
            )
        };

        let body = match read_request_body(http_session).await {
            Ok(body) => body,
            Err(e) => return ResponseBuilder::error_http(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if method == Method::POST
            && !body.is_empty()
            && !is_json(http_session.get_header(header::CONTENT_TYPE))
        {
            return ResponseBuilder::error_http(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json",
            );
        }

        let req = AdminRequest {
            params: BTreeMap::new(),
            query,
            body,
        };
        self.dispatch(&method, &path, req).await
    }
}

fn authorized(header: Option<&HeaderValue>, api_key: &str) -> bool {
    matches!(header.map(HeaderValue::to_str), Some(Ok(key)) if key == api_key)
}

fn is_json(header: Option<&HeaderValue>) -> bool {
    match header.and_then(|value| value.to_str().ok()) {
        Some(value) => value
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim() == content_type::APPLICATION_JSON),
        None => false,
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> ScoutResult<Vec<u8>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session
        .read_request_body()
        .await
        .map_err(|e| ScoutError::Validation(format!("Failed to read request body: {e}")))?
    {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}

fn error_status(err: &ScoutError) -> StatusCode {
    match err {
        ScoutError::Validation(_) | ScoutError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Value of `name` in a query string, percent-decoded.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| {
            let value = value.replace('+', " ");
            String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
        })
}

fn seconds(wait: Option<Duration>) -> Option<f64> {
    wait.map(|wait| wait.as_secs_f64())
}

#[derive(Serialize)]
struct AcquireResponse {
    permitted: bool,
    wait_seconds: Option<f64>,
}

#[derive(Serialize)]
struct WaitResponse {
    wait_seconds: Option<f64>,
}

#[derive(Serialize)]
struct RemovedResponse<T> {
    removed: T,
}

struct BucketListHandler;

#[async_trait]
impl Handler for BucketListHandler {
    async fn handle(&self, ctx: &AppContext, _req: AdminRequest) -> HandlerResult {
        Ok(ResponseBuilder::success_json(&ctx.limiter.snapshot()))
    }
}

struct AcquireHandler;

#[async_trait]
impl Handler for AcquireHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        let source = req.param("source")?;
        let permitted = ctx.limiter.try_acquire(source);
        let wait_seconds = if permitted {
            Some(0.0)
        } else {
            seconds(ctx.limiter.wait_time(source))
        };
        Ok(ResponseBuilder::success_json(&AcquireResponse {
            permitted,
            wait_seconds,
        }))
    }
}

struct WaitHandler;

#[async_trait]
impl Handler for WaitHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        let source = req.param("source")?;
        Ok(ResponseBuilder::success_json(&WaitResponse {
            wait_seconds: seconds(ctx.limiter.wait_time(source)),
        }))
    }
}

struct ResetHandler;

#[async_trait]
impl Handler for ResetHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        ctx.limiter.reset(req.params.get("source").map(String::as_str));
        Ok(ResponseBuilder::empty(StatusCode::NO_CONTENT))
    }
}

struct CacheStatsHandler;

#[async_trait]
impl Handler for CacheStatsHandler {
    async fn handle(&self, ctx: &AppContext, _req: AdminRequest) -> HandlerResult {
        Ok(ResponseBuilder::success_json(&ctx.cache.stats()))
    }
}

struct CacheClearHandler;

#[async_trait]
impl Handler for CacheClearHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        let prefix = query_param(req.query.as_deref(), "prefix");
        let removed = ctx.cache.clear(prefix.as_deref());
        Ok(ResponseBuilder::success_json(&RemovedResponse { removed }))
    }
}

struct SessionListHandler;

#[async_trait]
impl Handler for SessionListHandler {
    async fn handle(&self, ctx: &AppContext, _req: AdminRequest) -> HandlerResult {
        Ok(ResponseBuilder::success_json(&ctx.bus.sessions()))
    }
}

struct SessionDeleteHandler;

#[async_trait]
impl Handler for SessionDeleteHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        let removed = ctx.bus.unsubscribe(req.param("id")?);
        Ok(ResponseBuilder::success_json(&RemovedResponse { removed }))
    }
}

struct PublishHandler;

#[async_trait]
impl Handler for PublishHandler {
    async fn handle(&self, ctx: &AppContext, req: AdminRequest) -> HandlerResult {
        let session_id = req.param("id")?;
        let event: Event = serde_json::from_slice(&req.body)
            .map_err(|e| ScoutError::Validation(format!("Invalid event: {e}")))?;
        ctx.bus.publish(session_id, event)?;
        Ok(ResponseBuilder::json(
            StatusCode::ACCEPTED,
            &serde_json::json!({ "accepted": true }),
        ))
    }
}
