//! Scheduler counters and aggregate statistics documents.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Execution counters maintained by the scheduler. Counter reads and writes
/// use atomics; the running mean sits behind a short-lived mutex.
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    mean: Mutex<RunningMean>,
}

#[derive(Debug, Default)]
struct RunningMean {
    count: u64,
    value: f64,
}

impl SchedulerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, success: bool, duration_ms: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut mean = self.mean.lock().expect("mean lock poisoned");
        mean.count += 1;
        mean.value += (duration_ms - mean.value) / mean.count as f64;
    }

    pub fn snapshot(
        &self,
        is_running: bool,
        active_jobs: usize,
        running_executions: usize,
    ) -> SchedulerStats {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let avg_exec_ms = self.mean.lock().expect("mean lock poisoned").value;
        let success_rate = if total == 0 {
            "0.00".to_string()
        } else {
            format!("{:.2}", successful as f64 * 100.0 / total as f64)
        };
        SchedulerStats {
            total,
            successful,
            failed,
            avg_exec_ms,
            is_running,
            active_jobs,
            running_executions,
            success_rate,
        }
    }
}

/// Point-in-time view of the scheduling engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_exec_ms: f64,
    pub is_running: bool,
    pub active_jobs: usize,
    pub running_executions: usize,
    /// Fixed-2-decimal percentage, e.g. `"97.50"`.
    pub success_rate: String,
}

/// Aggregate counts backing `GET /jobs/stats`.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
    pub total_jobs: i64,
    pub active_jobs: i64,
    pub total_executions: i64,
    /// Executions started in the last 24 hours.
    pub recent_executions: i64,
    pub jobs_by_type: HashMap<String, i64>,
    pub calculated_at: DateTime<Utc>,
}
