//! Boundary to the upstream image-generation service
//!
//! The upstream is rate limited per credential and reports failures with a
//! loose mix of status codes and free-text bodies. This crate owns the shared
//! vocabulary the pool uses to react to those failures:
//!
//! - `UpstreamFailure` carries the status and body of one failed call
//! - `classify` maps a failure to an `ErrorClassification`
//! - `UpstreamClient` forwards a JSON payload with a pool credential

pub mod classify;
pub mod client;

pub use classify::classify;
pub use client::UpstreamClient;

/// Classification of upstream errors to determine retry/failover strategy.
///
/// - Transient retries on the same credential first
/// - Overload switches credential immediately, no quarantine
/// - Invalid quarantines the credential with the long policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Network failures, timeouts, 5xx and anything unrecognized
    Transient,
    /// The upstream's own concurrency or backoff signal
    Overload,
    /// The credential was rejected (auth, permission, token wording)
    Invalid,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Overload => "overload",
            ErrorClassification::Invalid => "invalid",
        }
    }
}

/// One failed upstream call.
///
/// `status` is 0 when no HTTP response was received (connect error, timeout).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upstream returned {status}: {body}")]
pub struct UpstreamFailure {
    pub status: u16,
    pub body: String,
}

impl UpstreamFailure {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A failure with no HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn is_transport(&self) -> bool {
        self.status == 0
    }

    /// Classify with the default heuristic.
    pub fn classification(&self) -> ErrorClassification {
        classify(self.status, &self.body)
    }
}
