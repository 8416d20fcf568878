//! Credential records and their lazily evaluated health
//!
//! A credential's health is never ticked by a timer. Every selection pass
//! calls `refresh` on each record, which lifts an expired quarantine, rolls
//! the rate-limit window when 60 seconds have passed, and recomputes
//! `available` from `enabled`, the quarantine expiry and the window counter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::BearerToken;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Length of the fixed rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Default selection weight for credentials created without one.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Default requests per window for credentials created without one.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// One upstream credential with its policy and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub secret: BearerToken,
    pub weight: u32,
    pub rate_limit: u32,
    /// Administrator intent.
    pub enabled: bool,
    /// Derived at selection time, persisted for display only.
    pub available: bool,
    pub requests_this_window: u32,
    pub window_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_until: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a fresh record with a generated id.
    pub fn new(entry: NewCredential, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: entry.name,
            secret: entry.secret,
            weight: entry.weight.max(1),
            rate_limit: entry.rate_limit,
            enabled: entry.enabled,
            available: entry.enabled,
            requests_this_window: 0,
            window_started_at: now,
            created_at: now,
            last_used_at: None,
            notes: entry.notes,
            quarantined_until: None,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined_until.is_some()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.requests_this_window >= self.rate_limit
    }

    /// Re-evaluate health at `now`. Returns true when a quarantine was lifted,
    /// which is a persisted change.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let mut lifted = false;
        if let Some(until) = self.quarantined_until
            && now >= until
        {
            self.quarantined_until = None;
            self.enabled = true;
            lifted = true;
            info!(credential = %self.label(), "quarantine expired, credential eligible again");
        }

        let elapsed = now
            .signed_duration_since(self.window_started_at)
            .to_std()
            .unwrap_or_default();
        if elapsed >= RATE_WINDOW {
            self.requests_this_window = 0;
            self.window_started_at = now;
        }

        self.available = self.enabled && !self.is_quarantined() && !self.is_rate_limited();
        lifted
    }

    /// Count one dispatch against the current window.
    pub fn consume(&mut self, now: DateTime<Utc>) {
        self.requests_this_window = self.requests_this_window.saturating_add(1);
        self.last_used_at = Some(now);
        if self.is_rate_limited() {
            self.available = false;
        }
    }

    /// Take the credential out of rotation until `now + duration`.
    pub fn quarantine(&mut self, now: DateTime<Utc>, duration: Duration, cause: &str) {
        let span = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let until = now.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.available = false;
        self.quarantined_until = Some(until);

        let note = format!(
            "[auto] quarantined for {} ({cause}) at {}",
            format_duration(duration),
            now.format("%Y-%m-%d %H:%M:%S")
        );
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{note}"),
            _ => note,
        });
    }

    /// Name when set, otherwise the id. Used in logs.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Admin-facing view with the secret masked.
    pub fn view(&self, now: DateTime<Utc>) -> CredentialView {
        let (formatted, remaining) = match self.quarantined_until {
            Some(until) => (
                Some(until.format("%Y-%m-%d %H:%M:%S").to_string()),
                Some(until.signed_duration_since(now).num_seconds().max(0)),
            ),
            None => (None, None),
        };
        CredentialView {
            id: self.id.clone(),
            name: self.name.clone(),
            secret: self.secret.masked(),
            weight: self.weight,
            rate_limit: self.rate_limit,
            enabled: self.enabled,
            available: self.available,
            requests_this_window: self.requests_this_window,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            notes: self.notes.clone(),
            quarantined_until: self.quarantined_until,
            quarantined_until_formatted: formatted,
            quarantine_remaining_secs: remaining,
        }
    }

    pub(crate) fn apply(&mut self, update: CredentialUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(secret) = update.secret {
            self.secret = secret;
        }
        if let Some(weight) = update.weight {
            self.weight = weight.max(1);
        }
        if let Some(rate_limit) = update.rate_limit {
            self.rate_limit = rate_limit;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
            self.available = enabled;
        }
        if let Some(notes) = update.notes {
            self.notes = Some(notes);
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else {
        format!("{secs}s")
    }
}

/// Input for `add` and `batch_import`.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub secret: BearerToken,
    pub name: String,
    pub weight: u32,
    pub rate_limit: u32,
    pub enabled: bool,
    pub notes: Option<String>,
}

impl NewCredential {
    /// Enabled credential with default weight and rate limit.
    pub fn new(secret: BearerToken) -> Self {
        Self {
            secret,
            name: String::new(),
            weight: DEFAULT_WEIGHT,
            rate_limit: DEFAULT_RATE_LIMIT,
            enabled: true,
            notes: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Partial update for `update`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub name: Option<String>,
    pub secret: Option<BearerToken>,
    pub weight: Option<u32>,
    pub rate_limit: Option<u32>,
    pub enabled: Option<bool>,
    pub notes: Option<String>,
}

/// Credential as exposed outside the pool.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub name: String,
    pub secret: String,
    pub weight: u32,
    pub rate_limit: u32,
    pub enabled: bool,
    pub available: bool,
    pub requests_this_window: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_until_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_remaining_secs: Option<i64>,
}

/// Why a credential is being quarantined. Selects the duration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    /// The upstream rejected the credential outright.
    Invalid,
    /// Every retry and switch failed with no specific cause.
    Exhausted,
}

impl QuarantineReason {
    pub fn label(&self) -> &'static str {
        match self {
            QuarantineReason::Invalid => "invalid",
            QuarantineReason::Exhausted => "exhausted",
        }
    }
}
