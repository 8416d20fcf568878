//! Failure classification for upstream responses
//!
//! The upstream has no structured error codes for the two cases the pool
//! cares about, so both are recognized by wording:
//!
//! - overload: the credential already has a task running, or the upstream
//!   asks the caller to back off. Not the credential's fault.
//! - invalid: the credential was rejected. 401/403 always count; other 4xx
//!   (and 200 bodies that failed to yield a result) count when the body
//!   carries auth wording.
//!
//! Server errors and transport failures are always transient, whatever the
//! body says. Below that, overload wording wins over auth wording, since
//! overload messages often mention the token that is busy.

use crate::ErrorClassification;

/// Phrases the upstream uses when a credential is busy or throttled.
const OVERLOAD_PATTERNS: &[&str] = &["concurrent", "too many", "wait", "progress"];

/// Phrases indicating the credential itself was rejected.
const INVALID_PATTERNS: &[&str] = &[
    "authorization",
    "unauthorized",
    "authentication",
    "permission",
    "token",
    "credentials",
    "login",
    "invalid",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify an upstream failure by HTTP status and response body.
///
/// Status 0 (no response) and 5xx are always Transient. Matching is
/// case-insensitive.
pub fn classify(status: u16, body: &str) -> ErrorClassification {
    if status == 0 || status >= 500 {
        return ErrorClassification::Transient;
    }

    let lower = body.to_lowercase();
    if contains_any(&lower, OVERLOAD_PATTERNS) {
        return ErrorClassification::Overload;
    }

    match status {
        401 | 403 => ErrorClassification::Invalid,
        429 => ErrorClassification::Overload,
        _ if contains_any(&lower, INVALID_PATTERNS) => ErrorClassification::Invalid,
        _ => ErrorClassification::Transient,
    }
}
