//! Client API token check
//!
//! When `API_AUTH_TOKEN` is configured, the generation and usage routes
//! require `Authorization: Bearer <token>`. Without it they are open.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::AppState;
use crate::error::GatewayError;

/// Byte comparison whose running time does not depend on where the inputs
/// first differ.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let max_len = left.len().max(right.len());
    let mut diff = left.len() ^ right.len();
    for i in 0..max_len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

/// Value of a `Bearer` authorization header. Other schemes yield `None`.
fn presented_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Reject requests that do not carry the configured API token.
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_ref() else {
        return next.run(request).await;
    };

    let authorized = presented_token(&request)
        .is_some_and(|p| constant_time_eq(p.as_bytes(), expected.bare().as_bytes()));
    if authorized {
        return next.run(request).await;
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    warn!(
        path = %request.uri().path(),
        request_id = %request_id,
        header_present = request.headers().contains_key(AUTHORIZATION),
        "rejected request without a valid API token"
    );
    GatewayError::Unauthorized.to_response(&request_id)
}
