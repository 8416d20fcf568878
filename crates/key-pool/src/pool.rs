//! Credential pool: store, rate limiter, quarantine and working set
//!
//! All four share one mutual-exclusion domain. Every selection pass reads
//! health, the rate-limit window and the working set together, so splitting
//! the lock would allow a torn read between "eligible" and "rate limited".
//!
//! The lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`. That keeps lock hold time to in-memory work and lets a
//! `WorkingGuard` release its mark from `Drop`.
//!
//! Persistence: each mutation serializes the snapshot under the lock and
//! stamps it with a generation number. The write itself happens after the
//! lock is released. Writers serialize on a separate async mutex that
//! remembers the newest generation written, so a stale copy that loses the
//! race is dropped instead of overwriting newer state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::BearerToken;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::credential::{
    Credential, CredentialUpdate, CredentialView, NewCredential, QuarantineReason,
};
use crate::error::{Error, Result};
use crate::guard::WorkingGuard;
use crate::selector;
use crate::snapshot::{self, SnapshotRef};
use crate::telemetry::{self, PoolUsage, UsageStats};

/// Quarantine applied when the upstream rejects a credential.
pub const INVALID_QUARANTINE: Duration = Duration::from_secs(24 * 3600);

/// Quarantine applied when every retry and switch failed.
pub const EXHAUSTED_QUARANTINE: Duration = Duration::from_secs(6 * 3600);

/// Pool construction settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Snapshot file. `None` keeps the pool in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub invalid_quarantine: Duration,
    pub exhausted_quarantine: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            invalid_quarantine: INVALID_QUARANTINE,
            exhausted_quarantine: EXHAUSTED_QUARANTINE,
        }
    }
}

/// Result of `batch_import`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Overall pool condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Health summary for the `/health` endpoint.
///
/// `available` counts credentials healthy by their own state; `working`
/// counts marks currently held, which may overlap `available`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub total: usize,
    pub available: usize,
    pub quarantined: usize,
    pub disabled: usize,
    pub working: usize,
}

#[derive(Debug, Clone)]
struct WorkingMark {
    task_id: String,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct PoolState {
    credentials: Vec<Credential>,
    usage: HashMap<String, UsageStats>,
    working: HashMap<BearerToken, WorkingMark>,
    generation: u64,
}

impl PoolState {
    fn position(&self, token: &BearerToken) -> Option<usize> {
        self.credentials.iter().position(|c| &c.secret == token)
    }

    fn refresh_all(&mut self, now: DateTime<Utc>) -> bool {
        let mut lifted = false;
        for credential in &mut self.credentials {
            lifted |= credential.refresh(now);
        }
        lifted
    }

    /// Weighted pick among eligible credentials, consuming one request from
    /// the winner's window. Health must already be refreshed.
    fn pick(&mut self, now: DateTime<Utc>, exclude: &HashSet<BearerToken>) -> Option<BearerToken> {
        let candidates: Vec<usize> = self
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.enabled
                    && c.available
                    && !c.is_quarantined()
                    && !c.is_rate_limited()
                    && !self.working.contains_key(&c.secret)
                    && !exclude.contains(&c.secret)
            })
            .map(|(i, _)| i)
            .collect();
        let weights: Vec<u32> = candidates
            .iter()
            .map(|&i| self.credentials[i].weight)
            .collect();

        let chosen = candidates[selector::choose(&weights)?];
        let credential = &mut self.credentials[chosen];
        credential.consume(now);
        debug!(
            credential = %credential.label(),
            requests = credential.requests_this_window,
            rate_limit = credential.rate_limit,
            "selected credential"
        );
        Some(credential.secret.clone())
    }

    fn set_working_gauge(&self) {
        metrics::gauge!("key_pool_working").set(self.working.len() as f64);
    }
}

/// Serialized snapshot waiting to be written.
struct PendingWrite {
    generation: u64,
    bytes: Vec<u8>,
}

struct Persister {
    path: PathBuf,
    /// Newest generation on disk.
    written: tokio::sync::Mutex<u64>,
}

/// The credential pool manager.
///
/// Constructed once by the composition root and shared as `Arc<KeyPool>`.
pub struct KeyPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    persister: Option<Persister>,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KeyPool {
    /// Empty pool on the system clock.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Empty pool on the given clock.
    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        let persister = config.snapshot_path.clone().map(|path| Persister {
            path,
            written: tokio::sync::Mutex::new(0),
        });
        Self {
            state: Mutex::new(PoolState::default()),
            config,
            clock,
            persister,
        }
    }

    /// Build a pool from an inline document or the snapshot file.
    ///
    /// The inline document wins when it yields at least one credential. A
    /// missing snapshot file is a cold start. An unreadable or unparseable
    /// snapshot file is an error, so it is never overwritten by an empty pool.
    pub async fn load(config: PoolConfig, inline: Option<&str>) -> Result<Self> {
        Self::load_with_clock(config, inline, Arc::new(SystemClock)).await
    }

    pub async fn load_with_clock(
        config: PoolConfig,
        inline: Option<&str>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let mut loaded = None;

        if let Some(text) = inline.map(str::trim).filter(|t| !t.is_empty()) {
            match snapshot::parse(text, now) {
                Ok(doc) if !doc.credentials.is_empty() => {
                    info!(
                        credentials = doc.credentials.len(),
                        "loaded credentials from inline document"
                    );
                    loaded = Some(doc);
                }
                Ok(_) => warn!("inline credential document has no credentials, using snapshot file"),
                Err(e) => warn!(error = %e, "inline credential document unparseable, using snapshot file"),
            }
        }

        if loaded.is_none()
            && let Some(path) = &config.snapshot_path
        {
            match snapshot::read(path, now).await? {
                Some(doc) => {
                    info!(
                        path = %path.display(),
                        credentials = doc.credentials.len(),
                        "loaded credential snapshot"
                    );
                    loaded = Some(doc);
                }
                None => info!(path = %path.display(), "no snapshot file, starting with an empty pool"),
            }
        }

        let pool = Self::with_clock(config, clock);
        if let Some(doc) = loaded {
            let mut state = pool.lock();
            state.credentials = doc.credentials;
            state.usage = doc.usage_stats;
        }
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Number of credentials in the pool.
    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- persistence --

    /// Serialize the current state under the lock. `None` for in-memory pools.
    fn stage(&self, state: &mut PoolState) -> Option<PendingWrite> {
        self.persister.as_ref()?;
        state.generation += 1;
        let doc = SnapshotRef {
            credentials: &state.credentials,
            usage_stats: &state.usage,
        };
        match snapshot::encode(&doc) {
            Ok(bytes) => Some(PendingWrite {
                generation: state.generation,
                bytes,
            }),
            Err(e) => {
                warn!(error = %e, "failed to serialize snapshot");
                None
            }
        }
    }

    async fn write(&self, pending: PendingWrite) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let mut written = persister.written.lock().await;
        if pending.generation <= *written {
            debug!(
                generation = pending.generation,
                written = *written,
                "skipping stale snapshot"
            );
            return Ok(());
        }
        snapshot::write_atomic(&persister.path, &pending.bytes).await?;
        *written = pending.generation;
        Ok(())
    }

    /// Write a staged snapshot. Failures are logged; in-memory state stays
    /// authoritative.
    async fn commit(&self, pending: Option<PendingWrite>) {
        if let Some(pending) = pending
            && let Err(e) = self.write(pending).await
        {
            warn!(error = %e, "failed to persist credential snapshot");
        }
    }

    /// Write the current state now. Used at shutdown.
    pub async fn flush(&self) -> Result<()> {
        let pending = {
            let mut state = self.lock();
            self.stage(&mut state)
        };
        match pending {
            Some(pending) => self.write(pending).await,
            None => Ok(()),
        }
    }

    // -- selection --

    /// One selection pass. With `task_id`, the winner is marked working in
    /// the same critical section.
    fn take(
        &self,
        task_id: Option<&str>,
        exclude: &HashSet<BearerToken>,
    ) -> (Option<BearerToken>, Option<PendingWrite>) {
        let mut state = self.lock();
        let now = self.clock.now();
        let lifted = state.refresh_all(now);

        if state.credentials.is_empty() {
            warn!("no credentials in pool");
        }
        let selected = state.pick(now, exclude);
        match (&selected, task_id) {
            (Some(token), Some(task_id)) => {
                state.working.insert(
                    token.clone(),
                    WorkingMark {
                        task_id: task_id.to_string(),
                        since: now,
                    },
                );
                state.set_working_gauge();
                metrics::counter!("key_pool_selections_total").increment(1);
            }
            (Some(_), None) => metrics::counter!("key_pool_selections_total").increment(1),
            (None, _) => {
                metrics::counter!("key_pool_exhausted_total").increment(1);
                if !state.credentials.is_empty() {
                    warn!("no eligible credential (all rate limited, quarantined, disabled or working)");
                }
            }
        }

        let pending = if selected.is_some() || lifted {
            self.stage(&mut state)
        } else {
            None
        };
        (selected, pending)
    }

    /// Pick an eligible credential by weight. `None` means the pool is
    /// exhausted for now; callers must not spin on it.
    ///
    /// The result is not marked working. Use `acquire` when the credential
    /// is about to be dispatched.
    pub async fn select(&self) -> Option<BearerToken> {
        let (selected, pending) = self.take(None, &HashSet::new());
        self.commit(pending).await;
        selected
    }

    /// Select and mark working under `task_id` in one step. The mark is
    /// released when the guard drops.
    pub async fn acquire(&self, task_id: impl Into<String>) -> Option<WorkingGuard<'_>> {
        self.acquire_excluding(task_id, &HashSet::new()).await
    }

    pub(crate) async fn acquire_excluding(
        &self,
        task_id: impl Into<String>,
        exclude: &HashSet<BearerToken>,
    ) -> Option<WorkingGuard<'_>> {
        let task_id = task_id.into();
        let (selected, pending) = self.take(Some(&task_id), exclude);
        self.commit(pending).await;
        selected.map(|token| WorkingGuard::new(self, token, task_id))
    }

    /// Reserve a specific credential for `task_id`, for calls that must reuse
    /// the credential an earlier call in the same task used.
    ///
    /// `None` when the credential is unknown or working for another task.
    /// Health and rate limit are not consulted.
    pub fn reserve(
        &self,
        token: &BearerToken,
        task_id: impl Into<String>,
    ) -> Option<WorkingGuard<'_>> {
        let task_id = task_id.into();
        let mut state = self.lock();
        state.position(token)?;
        if let Some(mark) = state.working.get(token)
            && mark.task_id != task_id
        {
            debug!(credential = %token.masked(), holder = %mark.task_id, "credential busy");
            return None;
        }
        let now = self.clock.now();
        state.working.insert(
            token.clone(),
            WorkingMark {
                task_id: task_id.clone(),
                since: now,
            },
        );
        state.set_working_gauge();
        drop(state);
        Some(WorkingGuard::new(self, token.clone(), task_id))
    }

    // -- working set --

    /// Mark a credential as dispatched for `task_id`. Re-marking replaces the
    /// task id, which upgrades a placeholder reservation in place.
    pub fn mark_working(&self, token: &BearerToken, task_id: impl Into<String>) {
        let task_id = task_id.into();
        let mut state = self.lock();
        let since = self.clock.now();
        debug!(credential = %token.masked(), task_id = %task_id, "marked working");
        state
            .working
            .insert(token.clone(), WorkingMark { task_id, since });
        state.set_working_gauge();
    }

    /// Clear a working mark. Returns whether one was present.
    pub fn release(&self, token: &BearerToken) -> bool {
        let mut state = self.lock();
        let removed = state.working.remove(token).is_some();
        if removed {
            debug!(credential = %token.masked(), "released");
            state.set_working_gauge();
        }
        removed
    }

    /// Clear the mark only while it still belongs to `task_id`.
    pub(crate) fn release_if_owned(&self, token: &BearerToken, task_id: &str) -> bool {
        let mut state = self.lock();
        let owned = state
            .working
            .get(token)
            .is_some_and(|mark| mark.task_id == task_id);
        if owned {
            state.working.remove(token);
            state.set_working_gauge();
            debug!(credential = %token.masked(), task_id, "released");
        }
        owned
    }

    /// Move the mark from `old_task` to `new_task`, only while `old_task`
    /// still holds it.
    pub(crate) fn rebind_if_owned(
        &self,
        token: &BearerToken,
        old_task: &str,
        new_task: &str,
    ) -> bool {
        let mut state = self.lock();
        let since = self.clock.now();
        match state.working.get_mut(token) {
            Some(mark) if mark.task_id == old_task => {
                mark.task_id = new_task.to_string();
                mark.since = since;
                debug!(credential = %token.masked(), old_task, new_task, "working mark rebound");
                true
            }
            _ => {
                warn!(
                    credential = %token.masked(),
                    old_task,
                    new_task,
                    "working mark no longer held, not rebinding"
                );
                false
            }
        }
    }

    pub fn is_working(&self, token: &BearerToken) -> bool {
        self.lock().working.contains_key(token)
    }

    /// Task id currently holding the credential.
    pub fn working_task(&self, token: &BearerToken) -> Option<String> {
        self.lock().working.get(token).map(|m| m.task_id.clone())
    }

    /// Release marks older than `ttl`. Backstop for callers that never
    /// released; returns how many were cleared.
    pub fn sweep_stale(&self, ttl: Duration) -> usize {
        let mut state = self.lock();
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let before = state.working.len();
        state.working.retain(|token, mark| {
            let stale = now.signed_duration_since(mark.since) >= ttl;
            if stale {
                warn!(
                    credential = %token.masked(),
                    task_id = %mark.task_id,
                    since = %mark.since,
                    "releasing stale working mark"
                );
            }
            !stale
        });
        let swept = before - state.working.len();
        if swept > 0 {
            state.set_working_gauge();
        }
        swept
    }

    // -- quarantine --

    /// Quarantine a credential under the policy for `reason` and return a
    /// replacement.
    ///
    /// A credential working for any task is left alone, but a replacement is
    /// still selected.
    pub async fn quarantine(
        &self,
        token: &BearerToken,
        reason: QuarantineReason,
    ) -> Option<BearerToken> {
        let duration = match reason {
            QuarantineReason::Invalid => self.config.invalid_quarantine,
            QuarantineReason::Exhausted => self.config.exhausted_quarantine,
        };
        self.apply_quarantine(token, duration, reason.label(), None)
            .await;
        self.select().await
    }

    /// Quarantine for an explicit duration and return a replacement.
    pub async fn quarantine_for(&self, token: &BearerToken, duration: Duration) -> Option<BearerToken> {
        self.apply_quarantine(token, duration, "manual", None).await;
        self.select().await
    }

    /// Apply a quarantine unless the credential is working for a task other
    /// than `owner`. Returns whether it was applied.
    pub(crate) async fn apply_quarantine(
        &self,
        token: &BearerToken,
        duration: Duration,
        cause: &str,
        owner: Option<&str>,
    ) -> bool {
        let pending = {
            let mut state = self.lock();
            if let Some(mark) = state.working.get(token)
                && owner != Some(mark.task_id.as_str())
            {
                warn!(
                    credential = %token.masked(),
                    task_id = %mark.task_id,
                    "credential is working for another task, skipping quarantine"
                );
                return false;
            }
            let Some(idx) = state.position(token) else {
                warn!(credential = %token.masked(), "quarantine target not in pool");
                return false;
            };
            let now = self.clock.now();
            let credential = &mut state.credentials[idx];
            credential.quarantine(now, duration, cause);
            warn!(
                credential = %credential.label(),
                cause,
                secs = duration.as_secs(),
                "credential quarantined"
            );
            metrics::counter!("key_pool_quarantines_total", "reason" => cause.to_string())
                .increment(1);
            self.stage(&mut state)
        };
        self.commit(pending).await;
        true
    }

    // -- telemetry --

    /// Record the outcome of one upstream call made with `token` and stamp
    /// its last use.
    pub async fn record(&self, token: &BearerToken, success: bool, latency: Duration) {
        let pending = {
            let mut state = self.lock();
            let Some(idx) = state.position(token) else {
                debug!(credential = %token.masked(), "outcome for unknown credential ignored");
                return;
            };
            let now = self.clock.now();
            state.credentials[idx].last_used_at = Some(now);
            let id = state.credentials[idx].id.clone();
            state
                .usage
                .entry(id)
                .or_default()
                .record(success, latency, now);
            let outcome = if success { "success" } else { "failure" };
            metrics::counter!("key_pool_requests_total", "outcome" => outcome).increment(1);
            self.stage(&mut state)
        };
        self.commit(pending).await;
    }

    /// Pool-wide usage rollup.
    pub async fn usage_stats(&self) -> PoolUsage {
        let (usage, pending) = {
            let mut state = self.lock();
            let lifted = state.refresh_all(self.clock.now());
            let mut usage = telemetry::aggregate(state.usage.values());
            usage.total_credentials = state.credentials.len();
            usage.enabled_credentials = state.credentials.iter().filter(|c| c.enabled).count();
            usage.available_credentials =
                state.credentials.iter().filter(|c| c.available).count();
            let pending = if lifted { self.stage(&mut state) } else { None };
            (usage, pending)
        };
        self.commit(pending).await;
        usage
    }

    /// Usage counters for one credential.
    pub fn credential_usage(&self, id: &str) -> Option<UsageStats> {
        self.lock().usage.get(id).cloned()
    }

    /// Health summary, re-evaluated at the current time.
    pub async fn health(&self) -> PoolHealth {
        let (health, pending) = {
            let mut state = self.lock();
            let lifted = state.refresh_all(self.clock.now());
            let total = state.credentials.len();
            let available = state.credentials.iter().filter(|c| c.available).count();
            let quarantined = state
                .credentials
                .iter()
                .filter(|c| c.is_quarantined())
                .count();
            let disabled = state
                .credentials
                .iter()
                .filter(|c| !c.enabled && !c.is_quarantined())
                .count();
            let status = if total > 0 && available == total {
                HealthStatus::Healthy
            } else if available > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            let health = PoolHealth {
                status,
                total,
                available,
                quarantined,
                disabled,
                working: state.working.len(),
            };
            let pending = if lifted { self.stage(&mut state) } else { None };
            (health, pending)
        };
        self.commit(pending).await;
        health
    }

    // -- administration --

    /// Add a credential. A secret already in the pool returns the existing
    /// record unchanged.
    pub async fn add(&self, entry: NewCredential) -> Result<Credential> {
        if entry.secret.is_empty() {
            return Err(Error::Invalid("empty secret".into()));
        }
        let (credential, pending) = {
            let mut state = self.lock();
            if let Some(idx) = state.position(&entry.secret) {
                debug!(credential = %entry.secret.masked(), "credential already present");
                return Ok(state.credentials[idx].clone());
            }
            let credential = Credential::new(entry, self.clock.now());
            state
                .usage
                .insert(credential.id.clone(), UsageStats::default());
            state.credentials.push(credential.clone());
            info!(id = %credential.id, credential = %credential.secret.masked(), "credential added");
            (credential, self.stage(&mut state))
        };
        self.commit(pending).await;
        Ok(credential)
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        self.lock().credentials.iter().find(|c| c.id == id).cloned()
    }

    /// All credentials with secrets masked.
    pub fn list(&self) -> Vec<CredentialView> {
        let state = self.lock();
        let now = self.clock.now();
        state.credentials.iter().map(|c| c.view(now)).collect()
    }

    /// Apply a partial update. Setting `enabled` also resets `available`.
    pub async fn update(&self, id: &str, update: CredentialUpdate) -> Result<Credential> {
        let (credential, pending) = {
            let mut state = self.lock();
            let Some(idx) = state.credentials.iter().position(|c| c.id == id) else {
                return Err(Error::NotFound(id.to_string()));
            };
            if let Some(secret) = &update.secret {
                if secret.is_empty() {
                    return Err(Error::Invalid("empty secret".into()));
                }
                if state.position(secret).is_some_and(|other| other != idx) {
                    return Err(Error::Invalid(format!(
                        "secret {} already belongs to another credential",
                        secret.masked()
                    )));
                }
            }
            state.credentials[idx].apply(update);
            let credential = state.credentials[idx].clone();
            info!(id = %credential.id, "credential updated");
            (credential, self.stage(&mut state))
        };
        self.commit(pending).await;
        Ok(credential)
    }

    /// Hard-delete a credential and its usage. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let pending = {
            let mut state = self.lock();
            let Some(idx) = state.credentials.iter().position(|c| c.id == id) else {
                return false;
            };
            let removed = state.credentials.remove(idx);
            state.usage.remove(&removed.id);
            if state.working.remove(&removed.secret).is_some() {
                state.set_working_gauge();
            }
            info!(id = %removed.id, "credential deleted");
            self.stage(&mut state)
        };
        self.commit(pending).await;
        true
    }

    /// Add many credentials, skipping empty secrets and secrets already
    /// present. Persists once, and only if something was imported.
    pub async fn batch_import(&self, entries: Vec<NewCredential>) -> ImportSummary {
        let (summary, pending) = {
            let mut state = self.lock();
            let now = self.clock.now();
            let mut summary = ImportSummary::default();
            for entry in entries {
                if entry.secret.is_empty() || state.position(&entry.secret).is_some() {
                    summary.skipped += 1;
                    continue;
                }
                let credential = Credential::new(entry, now);
                state
                    .usage
                    .insert(credential.id.clone(), UsageStats::default());
                state.credentials.push(credential);
                summary.imported += 1;
            }
            info!(
                imported = summary.imported,
                skipped = summary.skipped,
                "batch import finished"
            );
            let pending = if summary.imported > 0 {
                self.stage(&mut state)
            } else {
                None
            };
            (summary, pending)
        };
        self.commit(pending).await;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::TimeZone;

    fn token(s: &str) -> BearerToken {
        BearerToken::parse(s)
    }

    fn mock_clock() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap())
    }

    fn pool_with(clock: &MockClock) -> KeyPool {
        KeyPool::with_clock(PoolConfig::default(), Arc::new(clock.clone()))
    }

    async fn add(pool: &KeyPool, secret: &str, weight: u32, rate_limit: u32) -> Credential {
        pool.add(
            NewCredential::new(token(secret))
                .weight(weight)
                .rate_limit(rate_limit),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn selection_frequency_follows_weights() {
        let pool = KeyPool::new(PoolConfig::default());
        add(&pool, "sk-light-000", 1, u32::MAX).await;
        add(&pool, "sk-heavy-000", 3, u32::MAX).await;

        let trials = 10_000;
        let mut heavy = 0;
        for _ in 0..trials {
            let picked = pool.select().await.unwrap();
            if picked.bare() == "sk-heavy-000" {
                heavy += 1;
            }
        }
        let share = heavy as f64 / trials as f64;
        assert!((share - 0.75).abs() < 0.05, "heavy share was {share}");
    }

    #[tokio::test]
    async fn working_credential_is_never_selected() {
        let pool = KeyPool::new(PoolConfig::default());
        add(&pool, "sk-busy-0000", 1, u32::MAX).await;
        add(&pool, "sk-free-0000", 1, u32::MAX).await;

        pool.mark_working(&token("Bearer sk-busy-0000"), "task-1");
        for _ in 0..200 {
            assert_eq!(pool.select().await.unwrap().bare(), "sk-free-0000");
        }

        assert!(pool.release(&token("sk-busy-0000")));
        let mut seen_busy = false;
        for _ in 0..200 {
            if pool.select().await.unwrap().bare() == "sk-busy-0000" {
                seen_busy = true;
                break;
            }
        }
        assert!(seen_busy, "released credential must be selectable again");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_share_a_credential() {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        for i in 0..3 {
            add(&pool, &format!("sk-shared-{i:04}"), 1, u32::MAX).await;
        }
        let held = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for t in 0..16 {
            let pool = Arc::clone(&pool);
            let held = Arc::clone(&held);
            handles.push(tokio::spawn(async move {
                for n in 0..200 {
                    let Some(guard) = pool.acquire(format!("task-{t}-{n}")).await else {
                        tokio::task::yield_now().await;
                        continue;
                    };
                    let secret = guard.token().bare().to_string();
                    assert!(
                        held.lock().unwrap().insert(secret.clone()),
                        "{secret} handed out twice"
                    );
                    tokio::task::yield_now().await;
                    held.lock().unwrap().remove(&secret);
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.health().await.working, 0);
    }

    #[tokio::test]
    async fn rate_limit_window_closes_and_reopens() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        add(&pool, "sk-limited-00", 1, 3).await;

        for _ in 0..3 {
            assert!(pool.select().await.is_some());
        }
        assert!(pool.select().await.is_none(), "fourth call in window");

        clock.advance(Duration::from_secs(59));
        assert!(pool.select().await.is_none());

        clock.advance(Duration::from_secs(1));
        assert!(pool.select().await.is_some(), "window boundary resets");
    }

    #[tokio::test]
    async fn quarantine_expires_without_intervention() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        add(&pool, "sk-flaky-0000", 1, 60).await;

        let replacement = pool
            .quarantine_for(&token("sk-flaky-0000"), Duration::from_secs(1))
            .await;
        assert!(replacement.is_none());
        assert!(pool.select().await.is_none());

        clock.advance(Duration::from_secs(1));
        assert_eq!(pool.select().await.unwrap().bare(), "sk-flaky-0000");
    }

    #[tokio::test]
    async fn quarantine_by_reason_uses_policy_duration() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        let bad = add(&pool, "sk-rejected-0", 1, 60).await;
        add(&pool, "sk-spare-0000", 1, 60).await;

        let replacement = pool
            .quarantine(&token("Bearer sk-rejected-0"), QuarantineReason::Invalid)
            .await;
        assert_eq!(replacement.unwrap().bare(), "sk-spare-0000");

        let stored = pool.get(&bad.id).unwrap();
        assert_eq!(
            stored.quarantined_until,
            Some(clock.now() + chrono::Duration::hours(24))
        );
        assert!(stored.notes.unwrap().contains("(invalid)"));
    }

    #[tokio::test]
    async fn quarantine_skips_working_credential() {
        let pool = KeyPool::new(PoolConfig::default());
        let busy = add(&pool, "sk-inflight-0", 1, 60).await;
        add(&pool, "sk-backup-000", 1, 60).await;

        pool.mark_working(&busy.secret, "task-9");
        let replacement = pool
            .quarantine(&busy.secret, QuarantineReason::Exhausted)
            .await;

        assert_eq!(replacement.unwrap().bare(), "sk-backup-000");
        assert!(pool.get(&busy.id).unwrap().quarantined_until.is_none());
    }

    #[tokio::test]
    async fn owner_can_quarantine_its_own_credential() {
        let pool = KeyPool::new(PoolConfig::default());
        let c = add(&pool, "sk-owned-0000", 1, 60).await;
        pool.mark_working(&c.secret, "task-1");

        assert!(!pool.apply_quarantine(&c.secret, EXHAUSTED_QUARANTINE, "exhausted", Some("task-2")).await);
        assert!(pool.apply_quarantine(&c.secret, EXHAUSTED_QUARANTINE, "exhausted", Some("task-1")).await);
        assert!(pool.get(&c.id).unwrap().is_quarantined());
    }

    #[tokio::test]
    async fn guard_releases_on_drop_and_rebinds() {
        let pool = KeyPool::new(PoolConfig::default());
        let c = add(&pool, "sk-guarded-00", 1, 60).await;

        {
            let mut guard = pool.acquire("req_placeholder").await.unwrap();
            assert_eq!(guard.token(), &c.secret);
            assert_eq!(pool.working_task(&c.secret).as_deref(), Some("req_placeholder"));

            assert!(guard.rebind("task_real"));
            assert_eq!(guard.task_id(), "task_real");
            assert_eq!(pool.working_task(&c.secret).as_deref(), Some("task_real"));
            assert!(pool.acquire("other").await.is_none());
        }
        assert!(!pool.is_working(&c.secret));
    }

    #[tokio::test]
    async fn guard_does_not_release_a_mark_it_no_longer_owns() {
        let pool = KeyPool::new(PoolConfig::default());
        let c = add(&pool, "sk-handoff-00", 1, 60).await;

        let guard = pool.acquire("task-a").await.unwrap();
        pool.mark_working(&c.secret, "task-b");
        drop(guard);

        assert_eq!(pool.working_task(&c.secret).as_deref(), Some("task-b"));
    }

    #[tokio::test]
    async fn rebind_after_sweep_leaves_the_new_holder_alone() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        let c = add(&pool, "sk-swept-0000", 1, 60).await;

        let mut stale = pool.acquire("placeholder-a").await.unwrap();
        clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(pool.sweep_stale(Duration::from_secs(30 * 60)), 1);

        let holder = pool.reserve(&c.secret, "task-b").unwrap();
        assert!(!stale.rebind("real-a"));
        assert_eq!(stale.task_id(), "placeholder-a");
        assert_eq!(pool.working_task(&c.secret).as_deref(), Some("task-b"));

        drop(stale);
        assert_eq!(pool.working_task(&c.secret).as_deref(), Some("task-b"));
        drop(holder);
        assert!(!pool.is_working(&c.secret));
    }

    #[tokio::test]
    async fn reserve_respects_other_tasks() {
        let pool = KeyPool::new(PoolConfig::default());
        let c = add(&pool, "sk-affinity-0", 1, 60).await;

        let first = pool.reserve(&c.secret, "task-1").unwrap();
        assert!(pool.reserve(&c.secret, "task-2").is_none());
        assert!(pool.reserve(&token("sk-unknown-00"), "task-1").is_none());
        drop(first);

        assert!(pool.reserve(&c.secret, "task-2").is_some());
    }

    #[tokio::test]
    async fn sweep_releases_only_stale_marks() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        let old = add(&pool, "sk-leaked-000", 1, 60).await;
        let fresh = add(&pool, "sk-recent-000", 1, 60).await;

        pool.mark_working(&old.secret, "task-old");
        clock.advance(Duration::from_secs(20 * 60));
        pool.mark_working(&fresh.secret, "task-new");
        clock.advance(Duration::from_secs(10 * 60));

        assert_eq!(pool.sweep_stale(Duration::from_secs(30 * 60)), 1);
        assert!(!pool.is_working(&old.secret));
        assert!(pool.is_working(&fresh.secret));
    }

    #[tokio::test]
    async fn add_is_idempotent_by_secret() {
        let pool = KeyPool::new(PoolConfig::default());
        let first = add(&pool, "sk-same-00000", 2, 60).await;
        let second = pool
            .add(NewCredential::new(token("Bearer sk-same-00000")).name("dup"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.weight, 2);
        assert_eq!(pool.len(), 1);
        assert!(matches!(
            pool.add(NewCredential::new(token("  "))).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn update_and_delete() {
        let pool = KeyPool::new(PoolConfig::default());
        let a = add(&pool, "sk-update-a00", 1, 60).await;
        let b = add(&pool, "sk-update-b00", 1, 60).await;

        let updated = pool
            .update(
                &a.id,
                CredentialUpdate {
                    enabled: Some(false),
                    weight: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled && !updated.available);
        assert_eq!(updated.weight, 1);
        for _ in 0..20 {
            assert_eq!(pool.select().await.unwrap().bare(), "sk-update-b00");
        }

        let clash = pool
            .update(
                &a.id,
                CredentialUpdate {
                    secret: Some(b.secret.clone()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(clash, Err(Error::Invalid(_))));
        assert!(matches!(
            pool.update("missing", CredentialUpdate::default()).await,
            Err(Error::NotFound(_))
        ));

        assert!(pool.delete(&b.id).await);
        assert!(!pool.delete(&b.id).await);
        assert!(pool.get(&b.id).is_none());
        assert!(pool.credential_usage(&b.id).is_none());
    }

    #[tokio::test]
    async fn batch_import_skips_duplicates() {
        let pool = KeyPool::new(PoolConfig::default());
        add(&pool, "sk-existing-0", 1, 60).await;

        let summary = pool
            .batch_import(vec![
                NewCredential::new(token("sk-existing-0")),
                NewCredential::new(token("sk-new-one-00")),
                NewCredential::new(token("Bearer sk-new-one-00")),
                NewCredential::new(token("")),
                NewCredential::new(token("sk-new-two-00")).weight(5),
            ])
            .await;

        assert_eq!(
            summary,
            ImportSummary {
                imported: 2,
                skipped: 3
            }
        );
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn list_masks_secrets() {
        let pool = KeyPool::new(PoolConfig::default());
        add(&pool, "sk-abcdefghijklmnop", 1, 60).await;

        let views = pool.list();
        assert_eq!(views[0].secret, "sk-abc...mnop");
        let json = serde_json::to_string(&views).unwrap();
        assert!(!json.contains("sk-abcdefghijklmnop"));
    }

    #[tokio::test]
    async fn usage_and_health_summaries() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        assert_eq!(pool.health().await.status, HealthStatus::Unhealthy);

        let a = add(&pool, "sk-usage-a000", 1, 60).await;
        let b = add(&pool, "sk-usage-b000", 1, 60).await;
        assert_eq!(pool.health().await.status, HealthStatus::Healthy);

        pool.record(&a.secret, true, Duration::from_millis(250)).await;
        pool.record(&a.secret, false, Duration::ZERO).await;
        pool.record(&b.secret, true, Duration::from_millis(750)).await;

        pool.apply_quarantine(&b.secret, EXHAUSTED_QUARANTINE, "exhausted", None)
            .await;

        let usage = pool.usage_stats().await;
        assert_eq!(usage.total_credentials, 2);
        assert_eq!(usage.available_credentials, 1);
        assert_eq!(usage.total_requests, 3);
        assert_eq!(usage.succeeded, 2);
        assert!((usage.avg_latency_ms - 500.0).abs() < 1e-9);
        assert_eq!(usage.last_7_days["2026-06-01"].failed, 1);

        let health = pool.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.status.label(), "degraded");
        assert_eq!(health.quarantined, 1);
        assert_eq!(health.available, 1);

        clock.advance(EXHAUSTED_QUARANTINE);
        assert_eq!(pool.health().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn record_stamps_last_use_on_reserved_credential() {
        let clock = mock_clock();
        let pool = pool_with(&clock);
        let c = add(&pool, "sk-pinned-000", 1, 60).await;

        let guard = pool.reserve(&c.secret, "task-pin").unwrap();
        assert!(pool.get(&c.id).unwrap().last_used_at.is_none());

        clock.advance(Duration::from_secs(90));
        pool.record(guard.token(), true, Duration::from_millis(40)).await;
        assert_eq!(pool.get(&c.id).unwrap().last_used_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            snapshot_path: Some(dir.path().join("api_keys.json")),
            ..Default::default()
        };

        let pool = KeyPool::load(config.clone(), None).await.unwrap();
        assert!(pool.is_empty());
        let (a, b) = tokio::join!(
            pool.add(NewCredential::new(token("sk-persist-a0")).name("a")),
            pool.add(NewCredential::new(token("sk-persist-b0")).name("b")),
        );
        let a = a.unwrap();
        b.unwrap();
        pool.record(&a.secret, true, Duration::from_millis(40)).await;
        drop(pool);

        let reloaded = KeyPool::load(config, None).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&a.id).unwrap().name, "a");
        assert_eq!(reloaded.credential_usage(&a.id).unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn inline_document_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.json");
        tokio::fs::write(&path, r#"["sk-from-file0"]"#).await.unwrap();
        let config = PoolConfig {
            snapshot_path: Some(path),
            ..Default::default()
        };

        let pool = KeyPool::load(config.clone(), Some(r#"["sk-from-env00"]"#))
            .await
            .unwrap();
        assert_eq!(pool.list()[0].secret, "sk-fro...nv00");

        let pool = KeyPool::load(config.clone(), Some("[]")).await.unwrap();
        assert_eq!(pool.select().await.unwrap().bare(), "sk-from-file0");

        let pool = KeyPool::load(config, Some("{broken")).await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = KeyPool::load(
            PoolConfig {
                snapshot_path: Some(path.clone()),
                ..Default::default()
            },
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::Snapshot(_))));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{not json");
    }

    #[tokio::test]
    async fn flush_writes_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.json");
        let pool = KeyPool::new(PoolConfig {
            snapshot_path: Some(path.clone()),
            ..Default::default()
        });

        pool.flush().await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["credentials"], serde_json::json!([]));
    }
}
