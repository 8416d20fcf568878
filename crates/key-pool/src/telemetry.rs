//! Per-credential usage statistics and pool-wide aggregation

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distinct dates kept per credential.
pub const DAILY_RETENTION: usize = 30;

/// Dates included in the pool-wide rollup.
pub const ROLLUP_DAYS: usize = 7;

/// Success/failure counts for one UTC date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    #[serde(alias = "successful")]
    pub succeeded: u64,
    pub failed: u64,
}

/// Usage counters for one credential.
///
/// `daily` is keyed by `YYYY-MM-DD`, so key order is date order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Mean latency of successful calls, in milliseconds.
    pub avg_latency_ms: f64,
    /// Calls folded into `avg_latency_ms`.
    #[serde(default)]
    pub latency_samples: u64,
    pub daily: BTreeMap<String, DailyUsage>,
}

impl UsageStats {
    /// Count one completed call at `now`.
    ///
    /// Only successful calls with a positive latency move the average.
    pub fn record(&mut self, success: bool, latency: Duration, now: DateTime<Utc>) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        if success && latency_ms > 0.0 {
            self.latency_samples += 1;
            let n = self.latency_samples as f64;
            self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
        }

        let day = self
            .daily
            .entry(now.format("%Y-%m-%d").to_string())
            .or_default();
        if success {
            day.succeeded += 1;
        } else {
            day.failed += 1;
        }

        while self.daily.len() > DAILY_RETENTION {
            self.daily.pop_first();
        }
    }
}

/// Pool-wide usage summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolUsage {
    pub total_credentials: usize,
    pub enabled_credentials: usize,
    pub available_credentials: usize,
    pub total_requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Percentage of successful requests, 0 when nothing was recorded.
    pub success_rate: f64,
    /// Mean of the non-zero per-credential averages.
    pub avg_latency_ms: f64,
    pub last_7_days: BTreeMap<String, DailyUsage>,
}

/// Fold per-credential stats into pool totals.
///
/// The credential counts are filled in by the caller, which owns the records.
pub fn aggregate<'a>(stats: impl IntoIterator<Item = &'a UsageStats>) -> PoolUsage {
    let mut usage = PoolUsage::default();
    let mut latencies = Vec::new();
    let mut by_date: BTreeMap<String, DailyUsage> = BTreeMap::new();

    for s in stats {
        usage.total_requests += s.total;
        usage.succeeded += s.succeeded;
        usage.failed += s.failed;
        if s.avg_latency_ms > 0.0 {
            latencies.push(s.avg_latency_ms);
        }
        for (date, day) in &s.daily {
            let merged = by_date.entry(date.clone()).or_default();
            merged.succeeded += day.succeeded;
            merged.failed += day.failed;
        }
    }

    if usage.total_requests > 0 {
        usage.success_rate = usage.succeeded as f64 / usage.total_requests as f64 * 100.0;
    }
    if !latencies.is_empty() {
        usage.avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
    }

    while by_date.len() > ROLLUP_DAYS {
        by_date.pop_first();
    }
    usage.last_7_days = by_date;
    usage
}
