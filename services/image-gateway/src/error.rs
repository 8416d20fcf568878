//! Per-request error types
//!
//! Every failure a client can see is one of these, rendered as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// No eligible credential. Clients should back off.
    #[error("no upstream credential available, retry later")]
    PoolExhausted,

    /// Every attempt on every credential failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing or invalid API token")]
    Unauthorized,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PoolExhausted => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Error `type` field in the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::PoolExhausted => "pool_exhausted",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Unauthorized => "unauthorized",
        }
    }

    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
