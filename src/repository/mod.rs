//! Typed persistence operations for jobs and their execution history.
//!
//! [`JobRepository`] is the seam between the scheduling engine, the control
//! plane, and the durable store. The production implementation runs over
//! PostgreSQL; an in-memory implementation (feature `test-util`) backs tests
//! that need no database.

use crate::job::{ExecutionStatus, Job, JobExecution, JobId, JobPatch, JobType, NewJob};
use crate::stats::DatabaseStats;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod postgres;

#[cfg(feature = "test-util")]
pub mod test;

pub use postgres::PostgresRepository;

/// Hard cap on page size for list endpoints.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Cap on jobs loaded into the scheduler at once.
pub const MAX_ACTIVE_JOBS: i64 = 1000;

/// Filter for `find_all`. Field order is the canonical cache-key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub is_active: Option<bool>,
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub search: Option<String>,
}

impl JobFilter {
    pub fn is_empty(&self) -> bool {
        self.is_active.is_none()
            && self.job_type.is_none()
            && self.tags.is_empty()
            && self.search.is_none()
    }

    /// Canonical cache key for a list read with this filter and page window.
    pub fn cache_key(&self, page: u32, limit: u32) -> String {
        let doc = json!({
            "page": page,
            "limit": limit,
            "isActive": self.is_active,
            "jobType": self.job_type,
            "tags": self.tags,
            "search": self.search,
        });
        format!("jobs:{doc}")
    }

    /// Whether `job` satisfies this filter; shared by the in-memory
    /// implementation and tests.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(is_active) = self.is_active {
            if job.is_active != is_active {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if job.job_type != job_type {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| job.tags.contains(t)) {
            return false;
        }
        if let Some(search) = &self.search {
            if !job.name.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Page through jobs, newest first. Returns the page plus the total
    /// matching count.
    async fn find_all(&self, page: u32, limit: u32, filter: &JobFilter)
        -> Result<(Vec<Job>, u64)>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>>;

    /// Validate and insert; `next_run_at` is derived from the cron
    /// expression before the row is written.
    async fn create(&self, input: NewJob) -> Result<Job>;

    /// Merge a patch onto an existing job. Recomputes `next_run_at` when the
    /// cron expression changed. Returns `None` for an unknown id.
    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<Job>>;

    /// Delete a job, returning the removed row. Execution history cascades.
    async fn delete(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically bump `total_runs` plus the success or failure counter and
    /// stamp `last_run_at`.
    async fn update_job_stats(&self, id: JobId, success: bool) -> Result<()>;

    async fn set_next_run(&self, id: JobId, next_run_at: Option<DateTime<Utc>>) -> Result<()>;

    /// All active jobs ordered by `next_run_at`, soonest first. The diff
    /// basis for scheduler sync, so it filters on `is_active` alone.
    async fn get_active_jobs(&self, limit: i64) -> Result<Vec<Job>>;

    /// Insert a provisional `running` execution row.
    async fn insert_execution(&self, job_id: JobId, retry_count: i32) -> Result<JobExecution>;

    /// Terminal write for an execution; computes `completed_at` and
    /// `duration_ms`. A row already out of `running` is left untouched.
    async fn finish_execution(
        &self,
        execution: &JobExecution,
        status: ExecutionStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Execution history for one job, most recent first.
    async fn find_executions(
        &self,
        job_id: JobId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<JobExecution>, u64)>;

    /// Fail `running` rows older than their job's `timeout_ms` plus `grace`,
    /// counting each reconciled row against the owning job's `total_runs`
    /// and `failed_runs`. Returns the number of rows reconciled.
    async fn reconcile_orphaned_executions(&self, grace: Duration) -> Result<u64>;

    /// Periodic storage upkeep (e.g. ensuring history partitions).
    async fn run_maintenance(&self) -> Result<()>;

    /// Aggregate counts for the statistics endpoint.
    async fn database_stats(&self) -> Result<DatabaseStats>;
}

pub(crate) fn offset_for(page: u32, limit: u32) -> u32 {
    page.saturating_sub(1).saturating_mul(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_canonical() {
        let filter = JobFilter {
            is_active: Some(true),
            tags: vec!["nightly".into()],
            ..Default::default()
        };
        let a = filter.cache_key(1, 50);
        let b = filter.cache_key(1, 50);
        assert_eq!(a, b);
        assert!(a.starts_with("jobs:"));
        assert_ne!(a, filter.cache_key(2, 50));
        assert_ne!(a, JobFilter::default().cache_key(1, 50));
    }

    #[test]
    fn offset_math() {
        assert_eq!(offset_for(1, 50), 0);
        assert_eq!(offset_for(3, 20), 40);
        assert_eq!(offset_for(0, 20), 0);
    }
}
