//! Background release of abandoned working marks
//!
//! Guards release their marks on every exit path the runtime can see. A mark
//! set through the plain `mark_working` API, or one whose holder is stuck on
//! an upstream call that never returns, can still outlive its task. This
//! task clears marks older than a fixed age so the credential returns to
//! rotation eventually.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::KeyPool;

/// Spawn a task that runs `sweep_stale(ttl)` every `interval`.
pub fn spawn_sweep_task(
    pool: Arc<KeyPool>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; nothing can be stale at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let swept = pool.sweep_stale(ttl);
            if swept > 0 {
                info!(swept, "released stale working marks");
            } else {
                debug!("no stale working marks");
            }
        }
    })
}
