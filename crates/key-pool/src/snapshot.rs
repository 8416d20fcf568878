//! Durable snapshot of the pool
//!
//! The snapshot is one JSON document:
//!
//! ```json
//! { "credentials": [ ... ], "usage_stats": { "<credential id>": { ... } } }
//! ```
//!
//! Older deployments wrote other shapes, all of which load:
//! - `{ "keys": [...], "usage_stats": {...} }` with legacy field names
//!   (`key`, `max_rpm`, `is_enabled`, `temp_disabled_until`, ...)
//! - a bare array of credential objects
//! - a bare array of secret strings
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! target so a crash mid-write never leaves a truncated snapshot.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use common::BearerToken;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credential::{Credential, DEFAULT_RATE_LIMIT, DEFAULT_WEIGHT};
use crate::error::{Error, Result};
use crate::telemetry::{DailyUsage, UsageStats};

/// Snapshot document as written.
#[derive(Debug, Serialize)]
pub(crate) struct SnapshotRef<'a> {
    pub credentials: &'a [Credential],
    pub usage_stats: &'a HashMap<String, UsageStats>,
}

/// Parsed snapshot contents.
#[derive(Debug, Default)]
pub struct Loaded {
    pub credentials: Vec<Credential>,
    pub usage_stats: HashMap<String, UsageStats>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Entries(Vec<RawEntry>),
    Snapshot(RawSnapshot),
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default, alias = "keys")]
    credentials: Vec<RawEntry>,
    #[serde(default)]
    usage_stats: HashMap<String, RawUsage>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Secret(String),
    Record(Box<RawCredential>),
}

/// Timestamps appear as RFC 3339 strings or fractional unix seconds.
#[derive(Deserialize, Clone, Copy)]
#[serde(untagged)]
enum RawTime {
    Rfc3339(DateTime<Utc>),
    Unix(f64),
}

impl RawTime {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            RawTime::Rfc3339(t) => Some(t),
            RawTime::Unix(secs) if secs.is_finite() => {
                let millis = (secs * 1000.0) as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            RawTime::Unix(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct RawCredential {
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "key")]
    secret: Option<String>,
    weight: Option<u32>,
    #[serde(alias = "max_rpm")]
    rate_limit: Option<u32>,
    #[serde(alias = "is_enabled")]
    enabled: Option<bool>,
    available: Option<bool>,
    #[serde(alias = "requests")]
    requests_this_window: Option<u32>,
    #[serde(alias = "last_reset")]
    window_started_at: Option<RawTime>,
    created_at: Option<RawTime>,
    #[serde(alias = "last_used")]
    last_used_at: Option<RawTime>,
    notes: Option<String>,
    #[serde(alias = "temp_disabled_until")]
    quarantined_until: Option<RawTime>,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default, alias = "total_requests")]
    total: u64,
    #[serde(default, alias = "successful_requests")]
    succeeded: u64,
    #[serde(default, alias = "failed_requests")]
    failed: u64,
    #[serde(default)]
    avg_latency_ms: Option<f64>,
    /// Legacy average, in seconds.
    #[serde(default)]
    average_response_time: Option<f64>,
    #[serde(default)]
    latency_samples: Option<u64>,
    #[serde(default, alias = "daily_usage")]
    daily: std::collections::BTreeMap<String, DailyUsage>,
}

impl From<RawUsage> for UsageStats {
    fn from(raw: RawUsage) -> Self {
        let avg_latency_ms = raw
            .avg_latency_ms
            .or(raw.average_response_time.map(|secs| secs * 1000.0))
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0);
        // Older documents carry no sample count; their average spans every success
        let latency_samples = match raw.latency_samples {
            Some(n) => n,
            None if avg_latency_ms > 0.0 => raw.succeeded.max(1),
            None => 0,
        };
        UsageStats {
            total: raw.total,
            succeeded: raw.succeeded,
            failed: raw.failed,
            avg_latency_ms,
            latency_samples,
            daily: raw.daily,
        }
    }
}

fn fresh_credential(secret: BearerToken, now: DateTime<Utc>) -> Credential {
    Credential {
        id: uuid::Uuid::new_v4().to_string(),
        name: String::new(),
        secret,
        weight: DEFAULT_WEIGHT,
        rate_limit: DEFAULT_RATE_LIMIT,
        enabled: true,
        available: true,
        requests_this_window: 0,
        window_started_at: now,
        created_at: now,
        last_used_at: None,
        notes: None,
        quarantined_until: None,
    }
}

impl RawCredential {
    /// `None` when the record carries no secret. Bare-array records start
    /// with a fresh window; full snapshots keep their counters.
    fn into_credential(self, now: DateTime<Utc>, keep_counters: bool) -> Option<Credential> {
        let secret = BearerToken::parse(self.secret.as_deref().unwrap_or(""));
        if secret.is_empty() {
            return None;
        }
        let enabled = self.enabled.unwrap_or(true);
        let mut credential = fresh_credential(secret, now);
        if let Some(id) = self.id.filter(|id| !id.is_empty()) {
            credential.id = id;
        }
        credential.name = self.name.unwrap_or_default();
        credential.weight = self.weight.unwrap_or(DEFAULT_WEIGHT).max(1);
        credential.rate_limit = self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT);
        credential.enabled = enabled;
        credential.available = enabled;
        credential.created_at = self
            .created_at
            .and_then(RawTime::resolve)
            .unwrap_or(now);
        credential.last_used_at = self.last_used_at.and_then(RawTime::resolve);
        credential.notes = self.notes;
        credential.quarantined_until = self.quarantined_until.and_then(RawTime::resolve);

        if keep_counters {
            credential.available = self.available.unwrap_or(enabled);
            credential.requests_this_window = self.requests_this_window.unwrap_or(0);
            credential.window_started_at = self
                .window_started_at
                .and_then(RawTime::resolve)
                .unwrap_or(now);
        }
        Some(credential)
    }
}

/// Parse any supported document shape.
///
/// Object entries without a secret are skipped with a warning. Every loaded
/// credential gets a usage entry, empty if the document had none.
pub fn parse(text: &str, now: DateTime<Utc>) -> Result<Loaded> {
    let raw: RawDocument =
        serde_json::from_str(text).map_err(|e| Error::Snapshot(format!("parsing snapshot: {e}")))?;

    let (entries, usage, keep_counters) = match raw {
        RawDocument::Entries(entries) => (entries, HashMap::new(), false),
        RawDocument::Snapshot(doc) => (doc.credentials, doc.usage_stats, true),
    };

    let mut loaded = Loaded::default();
    for entry in entries {
        let credential = match entry {
            RawEntry::Secret(raw) => {
                let secret = BearerToken::parse(&raw);
                if secret.is_empty() {
                    warn!("skipping empty secret in snapshot");
                    continue;
                }
                fresh_credential(secret, now)
            }
            RawEntry::Record(record) => match record.into_credential(now, keep_counters) {
                Some(c) => c,
                None => {
                    warn!("skipping credential record without a secret");
                    continue;
                }
            },
        };
        if loaded
            .credentials
            .iter()
            .any(|existing| existing.secret == credential.secret)
        {
            warn!(credential = %credential.secret.masked(), "skipping duplicate secret in snapshot");
            continue;
        }
        loaded.credentials.push(credential);
    }

    let mut usage: HashMap<String, UsageStats> = usage
        .into_iter()
        .map(|(id, raw)| (id, UsageStats::from(raw)))
        .collect();
    for credential in &loaded.credentials {
        let stats = usage.remove(&credential.id).unwrap_or_default();
        loaded.usage_stats.insert(credential.id.clone(), stats);
    }

    Ok(loaded)
}

/// Read and parse the snapshot file. `Ok(None)` when the file does not exist.
pub async fn read(path: &Path, now: DateTime<Utc>) -> Result<Option<Loaded>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
    };
    parse(&text, now).map(Some)
}

/// Serialize the pool document.
pub(crate) fn encode(snapshot: &SnapshotRef<'_>) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(snapshot)
        .map_err(|e| Error::Snapshot(format!("serializing snapshot: {e}")))
}

/// Write a snapshot atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 on unix since the file holds secrets.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp snapshot: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting snapshot permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp snapshot: {e}")))?;

    debug!(path = %path.display(), "persisted snapshot");
    Ok(())
}
