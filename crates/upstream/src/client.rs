//! Thin JSON client for the upstream service
//!
//! Sends one request with one pool credential and turns every non-success
//! outcome into an `UpstreamFailure`. Retries and credential switching are
//! the pool's job, so this client never retries on its own.

use std::time::Duration;

use common::BearerToken;
use tracing::{debug, instrument};

use crate::UpstreamFailure;

/// Upstream HTTP client bound to a base URL.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// POST a JSON body to `path` and parse the JSON response.
    ///
    /// The credential is sent as `Authorization: Bearer <secret>`. Non-2xx
    /// responses become failures carrying the status and body text; a 2xx
    /// body that is not JSON is reported with its status so the classifier
    /// can still inspect it.
    #[instrument(skip_all, fields(path = %path, credential = %token.masked()))]
    pub async fn post_json(
        &self,
        token: &BearerToken,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamFailure> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, token.authorization())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamFailure::transport(format!("timeout after {}s", self.timeout.as_secs()))
                } else {
                    UpstreamFailure::transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamFailure::new(status.as_u16(), format!("reading body: {e}")))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "upstream rejected request");
            return Err(UpstreamFailure::new(status.as_u16(), text));
        }

        serde_json::from_str(&text).map_err(|_| UpstreamFailure::new(status.as_u16(), text))
    }
}
