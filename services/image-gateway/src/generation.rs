//! Image generation passthrough
//!
//! Receives an OpenAI-style generation request, takes a credential from the
//! pool for the life of the request, and forwards the JSON body upstream
//! through the retry coordinator. The upstream JSON is returned verbatim.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::{KeyPool, RetryCoordinator, RetryPolicy};
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use upstream::UpstreamClient;

use crate::error::GatewayError;

/// Route served here and forwarded upstream.
pub const GENERATIONS_PATH: &str = "/v1/images/generations";

/// Shared state passed to the generation handler via axum State extractor
#[derive(Clone)]
pub struct GenerationState {
    pub pool: Arc<KeyPool>,
    pub client: UpstreamClient,
    pub policy: RetryPolicy,
}

/// Handle one generation request and record its metrics.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn generate(state: &GenerationState, body: &[u8], request_id: String) -> Response {
    let started = Instant::now();
    let response = match forward(state, body, &request_id).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => {
            warn!(error = %e, "generation request failed");
            e.to_response(&request_id)
        }
    };
    crate::metrics::record_request(
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &GenerationState,
    body: &[u8],
    request_id: &str,
) -> Result<serde_json::Value, GatewayError> {
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("body is not valid JSON: {e}")))?;

    // Held until the response is built; dropping it releases the credential
    let guard = state
        .pool
        .acquire(request_id)
        .await
        .ok_or(GatewayError::PoolExhausted)?;

    let client = &state.client;
    let payload = &payload;
    let coordinator = RetryCoordinator::new(&state.pool, state.policy);
    let outcome = coordinator
        .run(guard.task_id(), guard.token(), |token| async move {
            client.post_json(&token, GENERATIONS_PATH, payload).await
        })
        .await;

    match outcome {
        Ok(success) => {
            info!(
                credential = %success.credential.masked(),
                attempts = success.attempts,
                switches = success.switches,
                "generation succeeded"
            );
            Ok(success.value)
        }
        Err(exhausted) => Err(GatewayError::Upstream(exhausted.to_string())),
    }
}
