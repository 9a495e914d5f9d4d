//! In-memory [`JobRepository`] for tests and database-free development.
//!
//! Mirrors the PostgreSQL implementation's observable semantics (ordering,
//! pagination, counter updates, cascade deletes) over process-local state so
//! scheduler and control-plane logic can be exercised without a database.

use super::{offset_for, JobFilter, JobRepository};
use crate::cron::CronExpr;
use crate::job::{ExecutionStatus, Job, JobExecution, JobId, JobPatch, NewJob};
use crate::stats::DatabaseStats;
use crate::{CronworkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    executions: Vec<JobExecution>,
}

/// Thread-safe in-memory repository.
#[derive(Clone, Default)]
pub struct TestRepository {
    inner: Arc<RwLock<Inner>>,
    fail_writes: Arc<AtomicBool>,
}

impl TestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write operation fail with a database error, for exercising
    /// the scheduler's store-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CronworkError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// Insert a fully-formed job row, bypassing validation. Test seeding only.
    pub async fn seed_job(&self, job: Job) {
        self.inner.write().await.jobs.insert(job.id, job);
    }

    /// Every stored execution for a job, insertion order.
    pub async fn executions_for(&self, job_id: JobId) -> Vec<JobExecution> {
        self.inner
            .read()
            .await
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.read().await.jobs.len()
    }
}

#[async_trait]
impl JobRepository for TestRepository {
    async fn find_all(
        &self,
        page: u32,
        limit: u32,
        filter: &JobFilter,
    ) -> Result<(Vec<Job>, u64)> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as u64;
        let rows = matched
            .into_iter()
            .skip(offset_for(page, limit) as usize)
            .take(limit as usize)
            .collect();
        Ok((rows, total))
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn create(&self, input: NewJob) -> Result<Job> {
        self.check_writes()?;
        let details = input.validate();
        if !details.is_empty() {
            return Err(CronworkError::validation(details));
        }
        let now = Utc::now();
        let cron_expression = input.cron_expression.clone().unwrap_or_default();
        let next_run_at = CronExpr::parse(&cron_expression)
            .map(|expr| expr.next_after(now))
            .ok();
        let job = Job {
            id: Uuid::new_v4(),
            name: input.name.clone().unwrap_or_default(),
            description: input.description.clone(),
            cron_expression,
            is_active: input.is_active,
            job_type: input.job_type,
            payload: input.payload.clone(),
            timeout_ms: input.timeout_ms,
            max_retries: input.max_retries,
            retry_delay_ms: input.retry_delay_ms,
            created_by: input.created_by.clone(),
            tags: input.normalized_tags(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
        };
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<Job>> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        let Some(existing) = inner.jobs.get(&id) else {
            return Ok(None);
        };
        let recompute = patch.changes_cron(existing);
        let mut merged = patch.apply(existing).map_err(CronworkError::validation)?;
        if recompute {
            if let Ok(expr) = CronExpr::parse(&merged.cron_expression) {
                merged.next_run_at = Some(expr.next_after(Utc::now()));
            }
        }
        inner.jobs.insert(id, merged.clone());
        Ok(Some(merged))
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        let removed = inner.jobs.remove(&id);
        if removed.is_some() {
            inner.executions.retain(|e| e.job_id != id);
        }
        Ok(removed)
    }

    async fn update_job_stats(&self, id: JobId, success: bool) -> Result<()> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.total_runs += 1;
            if success {
                job.successful_runs += 1;
            } else {
                job.failed_runs += 1;
            }
            let now = Utc::now();
            job.last_run_at = Some(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn set_next_run(&self, id: JobId, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.next_run_at = next_run_at;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_active_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut active: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.is_active)
            .cloned()
            .collect();
        // NULLS FIRST, then soonest next run.
        active.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        });
        active.truncate(limit.max(0) as usize);
        Ok(active)
    }

    async fn insert_execution(&self, job_id: JobId, retry_count: i32) -> Result<JobExecution> {
        self.check_writes()?;
        let execution = JobExecution {
            id: Uuid::new_v4(),
            job_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count,
            output: None,
        };
        self.inner.write().await.executions.push(execution.clone());
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        execution: &JobExecution,
        status: ExecutionStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        if let Some(row) = inner
            .executions
            .iter_mut()
            .find(|e| e.id == execution.id && e.status == ExecutionStatus::Running)
        {
            let completed_at = Utc::now();
            row.status = status;
            row.completed_at = Some(completed_at);
            row.duration_ms = Some((completed_at - row.started_at).num_milliseconds());
            row.error_message = error_message;
            row.output = output;
        }
        Ok(())
    }

    async fn find_executions(
        &self,
        job_id: JobId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<JobExecution>, u64)> {
        let inner = self.inner.read().await;
        let mut matched: Vec<JobExecution> = inner
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matched.len() as u64;
        let rows = matched
            .into_iter()
            .skip(offset_for(page, limit) as usize)
            .take(limit as usize)
            .collect();
        Ok((rows, total))
    }

    async fn reconcile_orphaned_executions(&self, grace: Duration) -> Result<u64> {
        self.check_writes()?;
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let Inner { jobs, executions } = &mut *inner;
        let mut reconciled = 0;
        for row in executions.iter_mut() {
            if row.status != ExecutionStatus::Running {
                continue;
            }
            let timeout_ms = jobs
                .get(&row.job_id)
                .map(|job| job.timeout_ms as i64)
                .unwrap_or(0);
            let deadline = row.started_at + Duration::milliseconds(timeout_ms) + grace;
            if now > deadline {
                row.status = ExecutionStatus::Failed;
                row.completed_at = Some(now);
                row.duration_ms = Some((now - row.started_at).num_milliseconds());
                row.error_message =
                    Some("orphaned: exceeded deadline without a terminal write".to_string());
                // A reconciled row is a terminal failure; count it like one.
                if let Some(job) = jobs.get_mut(&row.job_id) {
                    job.total_runs += 1;
                    job.failed_runs += 1;
                    job.updated_at = now;
                }
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn run_maintenance(&self) -> Result<()> {
        Ok(())
    }

    async fn database_stats(&self) -> Result<DatabaseStats> {
        let inner = self.inner.read().await;
        let cutoff = Utc::now() - Duration::hours(24);
        let mut jobs_by_type: HashMap<String, i64> = HashMap::new();
        for job in inner.jobs.values() {
            *jobs_by_type
                .entry(job.job_type.as_str().to_string())
                .or_default() += 1;
        }
        Ok(DatabaseStats {
            total_jobs: inner.jobs.len() as i64,
            active_jobs: inner.jobs.values().filter(|j| j.is_active).count() as i64,
            total_executions: inner.executions.len() as i64,
            recent_executions: inner
                .executions
                .iter()
                .filter(|e| e.started_at > cutoff)
                .count() as i64,
            jobs_by_type,
            calculated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use serde_json::json;

    fn new_job(name: &str, cron: &str) -> NewJob {
        NewJob {
            name: Some(name.to_string()),
            description: None,
            cron_expression: Some(cron.to_string()),
            is_active: true,
            job_type: JobType::Scheduled,
            payload: json!({}),
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 5000,
            created_by: "tests".to_string(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn create_derives_next_run() {
        let repo = TestRepository::new();
        let job = repo.create(new_job("tick", "* * * * *")).await.unwrap();
        let next = job.next_run_at.expect("next_run_at");
        let delta = next - Utc::now();
        assert!(delta.num_seconds() > 0 && delta.num_seconds() <= 60);
    }

    #[tokio::test]
    async fn find_all_filters_and_pages() {
        let repo = TestRepository::new();
        for i in 0..5 {
            let mut input = new_job(&format!("job-{i}"), "* * * * *");
            input.is_active = i % 2 == 0;
            input.tags = vec![format!("t{i}")];
            repo.create(input).await.unwrap();
        }

        let (_, total) = repo.find_all(1, 50, &JobFilter::default()).await.unwrap();
        assert_eq!(total, 5);

        let filter = JobFilter {
            is_active: Some(true),
            ..Default::default()
        };
        let (rows, total) = repo.find_all(1, 50, &filter).await.unwrap();
        assert_eq!(total, 3);
        assert!(rows.iter().all(|j| j.is_active));

        let filter = JobFilter {
            search: Some("JOB-1".to_string()),
            ..Default::default()
        };
        let (rows, _) = repo.find_all(1, 50, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "job-1");

        let (rows, total) = repo.find_all(2, 2, &JobFilter::default()).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn delete_cascades_to_executions() {
        let repo = TestRepository::new();
        let job = repo.create(new_job("doomed", "* * * * *")).await.unwrap();
        let exec = repo.insert_execution(job.id, 0).await.unwrap();
        repo.finish_execution(&exec, ExecutionStatus::Completed, None, None)
            .await
            .unwrap();

        assert_eq!(repo.executions_for(job.id).await.len(), 1);
        assert!(repo.delete(job.id).await.unwrap().is_some());
        assert!(repo.executions_for(job.id).await.is_empty());
        assert!(repo.find_by_id(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_update_keeps_counters_coherent() {
        let repo = TestRepository::new();
        let job = repo.create(new_job("counted", "* * * * *")).await.unwrap();
        repo.update_job_stats(job.id, true).await.unwrap();
        repo.update_job_stats(job.id, false).await.unwrap();
        repo.update_job_stats(job.id, true).await.unwrap();

        let job = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.total_runs, 3);
        assert_eq!(job.successful_runs, 2);
        assert_eq!(job.failed_runs, 1);
        assert_eq!(job.total_runs, job.successful_runs + job.failed_runs);
        assert!(job.last_run_at.is_some());
    }

    #[tokio::test]
    async fn orphan_reconciliation_fails_stale_rows() {
        let repo = TestRepository::new();
        let mut input = new_job("stale", "* * * * *");
        input.timeout_ms = 1000;
        let job = repo.create(input).await.unwrap();

        let exec = repo.insert_execution(job.id, 0).await.unwrap();
        // Backdate the row past timeout + grace.
        {
            let mut inner = repo.inner.write().await;
            inner.executions[0].started_at = Utc::now() - Duration::seconds(120);
        }

        let reconciled = repo
            .reconcile_orphaned_executions(Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(reconciled, 1);
        let rows = repo.executions_for(job.id).await;
        assert_eq!(rows[0].status, ExecutionStatus::Failed);
        assert!(rows[0].error_message.as_deref().unwrap().contains("orphaned"));
        assert_eq!(rows[0].id, exec.id);

        // The reconciled failure shows up in the job's counters.
        let job = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.total_runs, 1);
        assert_eq!(job.failed_runs, 1);
        assert_eq!(job.successful_runs, 0);
        assert_eq!(job.total_runs, job.successful_runs + job.failed_runs);
    }
}
