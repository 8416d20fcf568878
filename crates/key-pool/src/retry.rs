//! Retry and credential failover for one logical upstream operation
//!
//! The coordinator drives an operation first against the caller's credential
//! and then against up to `max_credential_switches` others, never reusing one
//! it already tried. How it reacts to each failure depends on the
//! classification:
//!
//! - Transient: retry the same credential after `retry_delay`, up to
//!   `max_retries_per_credential` times, then switch
//! - Overload: switch at once, no quarantine
//! - Invalid: long quarantine at once, then switch
//!
//! When everything fails, only the original credential takes the short
//! quarantine. Credentials tried later are not punished for following an
//! already failing one.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use common::BearerToken;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use upstream::{ErrorClassification, UpstreamFailure};

use crate::pool::KeyPool;

/// Attempt budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts on one credential after its first failure.
    pub max_retries_per_credential: u32,
    /// Other credentials to try after the original.
    pub max_credential_switches: u32,
    /// Pause between attempts on the same credential.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_per_credential: 1,
            max_credential_switches: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Maps an upstream status and body to a classification.
pub type Classifier = fn(u16, &str) -> ErrorClassification;

/// Completed operation.
#[derive(Debug)]
pub struct RetrySuccess<T> {
    pub value: T,
    /// Credential the successful call used.
    pub credential: BearerToken,
    pub attempts: u32,
    pub switches: u32,
}

/// Every attempt on every credential failed.
#[derive(Debug, thiserror::Error)]
#[error("upstream failed after {attempts} attempts across {switches} credential switches: {last}")]
pub struct RetryExhausted {
    #[source]
    pub last: UpstreamFailure,
    pub attempts: u32,
    pub switches: u32,
}

/// How the attempts on one credential ended.
struct Stop {
    failure: UpstreamFailure,
    class: ErrorClassification,
}

/// Runs operations against the pool under a `RetryPolicy`.
pub struct RetryCoordinator<'a> {
    pool: &'a KeyPool,
    policy: RetryPolicy,
    classifier: Classifier,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(pool: &'a KeyPool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            classifier: upstream::classify,
        }
    }

    /// Replace the failure classifier, e.g. for a different upstream.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run `op` starting with `original`.
    ///
    /// `task_id` identifies the operation. Switched-to credentials are marked
    /// working under it while they are tried, and quarantines issued here are
    /// allowed on credentials that task holds. Every attempt is recorded
    /// with the pool's telemetry.
    pub async fn run<T, F, Fut>(
        &self,
        task_id: &str,
        original: &BearerToken,
        mut op: F,
    ) -> Result<RetrySuccess<T>, RetryExhausted>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let mut attempts = 0;
        let mut tried = HashSet::from([original.clone()]);

        let original_stop = match self
            .attempt(task_id, original, &mut op, &mut attempts)
            .await
        {
            Ok(value) => {
                return Ok(RetrySuccess {
                    value,
                    credential: original.clone(),
                    attempts,
                    switches: 0,
                });
            }
            Err(stop) => stop,
        };
        let original_class = original_stop.class;
        let mut last = original_stop.failure;

        let mut switches = 0;
        while switches < self.policy.max_credential_switches {
            let Some(guard) = self.pool.acquire_excluding(task_id, &tried).await else {
                warn!(task_id, "no untried credential left to switch to");
                break;
            };
            let token = guard.token().clone();
            tried.insert(token.clone());
            switches += 1;
            info!(
                task_id,
                credential = %token.masked(),
                switch = switches,
                max_switches = self.policy.max_credential_switches,
                "switched credential"
            );

            match self.attempt(task_id, &token, &mut op, &mut attempts).await {
                Ok(value) => {
                    return Ok(RetrySuccess {
                        value,
                        credential: token,
                        attempts,
                        switches,
                    });
                }
                Err(stop) => last = stop.failure,
            }
        }

        match original_class {
            ErrorClassification::Transient => {
                warn!(
                    task_id,
                    credential = %original.masked(),
                    attempts,
                    switches,
                    "all retries and switches failed, quarantining original credential"
                );
                self.pool
                    .apply_quarantine(
                        original,
                        self.pool.config().exhausted_quarantine,
                        "exhausted",
                        Some(task_id),
                    )
                    .await;
            }
            ErrorClassification::Overload => {
                debug!(task_id, "original credential was overloaded, not quarantined");
            }
            ErrorClassification::Invalid => {}
        }

        Err(RetryExhausted {
            last,
            attempts,
            switches,
        })
    }

    /// Attempts on one credential until success or a reason to move on.
    async fn attempt<T, F, Fut>(
        &self,
        task_id: &str,
        token: &BearerToken,
        op: &mut F,
        attempts: &mut u32,
    ) -> Result<T, Stop>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let budget = self.policy.max_retries_per_credential + 1;
        let mut tries = 0;
        loop {
            tries += 1;
            *attempts += 1;
            let started = Instant::now();
            let outcome = op(token.clone()).await;
            let latency = started.elapsed();

            let failure = match outcome {
                Ok(value) => {
                    self.pool.record(token, true, latency).await;
                    return Ok(value);
                }
                Err(failure) => failure,
            };
            self.pool.record(token, false, latency).await;

            let class = (self.classifier)(failure.status, &failure.body);
            warn!(
                task_id,
                credential = %token.masked(),
                attempt = tries,
                budget,
                status = failure.status,
                class = class.label(),
                "upstream attempt failed"
            );

            match class {
                ErrorClassification::Overload => return Err(Stop { failure, class }),
                ErrorClassification::Invalid => {
                    self.pool
                        .apply_quarantine(
                            token,
                            self.pool.config().invalid_quarantine,
                            "invalid",
                            Some(task_id),
                        )
                        .await;
                    return Err(Stop { failure, class });
                }
                ErrorClassification::Transient if tries >= budget => {
                    return Err(Stop { failure, class });
                }
                ErrorClassification::Transient => {
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        }
    }
}
