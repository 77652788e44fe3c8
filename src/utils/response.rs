//! Response helpers shared by the admin and status HTTP apps.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text error body with the given status.
    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)
            .body(message.as_bytes().to_vec())
            .unwrap_or_else(|e| {
                log::error!("Failed to build error response: {e}");
                Response::new(b"Internal Server Error".to_vec())
            })
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        let body = match serde_json::to_vec(data) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to serialize JSON response: {e}");
                return Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                );
            }
        };

        Response::builder()
            .status(status)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type::APPLICATION_JSON),
            )
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("Failed to build JSON response: {e}");
                Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            })
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    pub fn empty(status: StatusCode) -> Response<Vec<u8>> {
        let mut response = Response::new(Vec::new());
        *response.status_mut() = status;
        response
    }
}
