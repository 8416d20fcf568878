//! Credential pool for the image gateway
//!
//! Holds many upstream credentials and hands them out one operation at a
//! time. Each credential has a selection weight, a per-minute rate limit and
//! a health state; selection is weighted random over the eligible ones.
//!
//! Credential lifecycle:
//! 1. Added via `add`/`batch_import` or loaded from the snapshot: eligible
//! 2. Selected: counts against its 60-second window; at the limit it sits
//!    out the rest of the window
//! 3. Acquired for a task: marked working, invisible to other selections
//!    until its `WorkingGuard` drops
//! 4. Rejected by the upstream: quarantined for 24h; exhausted all retries:
//!    quarantined for 6h
//! 5. Quarantine expiry: eligible again on the next selection pass
//!
//! Nothing here runs on a timer except the optional stale-mark sweeper.
//! Rate-limit windows and quarantines are re-evaluated when read.

pub mod clock;
pub mod credential;
pub mod error;
pub mod guard;
pub mod pool;
pub mod retry;
pub mod selector;
pub mod snapshot;
pub mod sweep;
pub mod telemetry;

pub use clock::{Clock, MockClock, SystemClock};
pub use credential::{
    Credential, CredentialUpdate, CredentialView, NewCredential, QuarantineReason,
};
pub use error::{Error, Result};
pub use guard::WorkingGuard;
pub use pool::{
    EXHAUSTED_QUARANTINE, HealthStatus, INVALID_QUARANTINE, ImportSummary, KeyPool, PoolConfig,
    PoolHealth,
};
pub use retry::{RetryCoordinator, RetryExhausted, RetryPolicy, RetrySuccess};
pub use sweep::spawn_sweep_task;
pub use telemetry::{DailyUsage, PoolUsage, UsageStats};
