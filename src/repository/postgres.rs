//! PostgreSQL implementation of [`JobRepository`].

use super::{offset_for, JobFilter, JobRepository};
use crate::cron::CronExpr;
use crate::job::{ExecutionStatus, Job, JobExecution, JobId, JobPatch, JobType, NewJob};
use crate::migrations;
use crate::stats::DatabaseStats;
use crate::store::Store;
use crate::{CronworkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, name, description, cron_expression, is_active, job_type, payload, \
     timeout_ms, max_retries, retry_delay_ms, created_by, tags, created_at, updated_at, \
     last_run_at, next_run_at, total_runs, successful_runs, failed_runs";

const EXECUTION_COLUMNS: &str = "id, job_id, status, started_at, completed_at, duration_ms, \
     error_message, retry_count, output";

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    cron_expression: String,
    is_active: bool,
    job_type: String,
    payload: serde_json::Value,
    timeout_ms: i32,
    max_retries: i32,
    retry_delay_ms: i32,
    created_by: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    total_runs: i64,
    successful_runs: i64,
    failed_runs: i64,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            name: self.name,
            description: self.description,
            cron_expression: self.cron_expression,
            is_active: self.is_active,
            // Check constraints guarantee the value; fall back defensively.
            job_type: JobType::parse(&self.job_type).unwrap_or_default(),
            payload: self.payload,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            created_by: self.created_by,
            tags: self.tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            total_runs: self.total_runs,
            successful_runs: self.successful_runs,
            failed_runs: self.failed_runs,
        }
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    retry_count: i32,
    output: Option<serde_json::Value>,
}

impl ExecutionRow {
    fn into_execution(self) -> JobExecution {
        JobExecution {
            id: self.id,
            job_id: self.job_id,
            status: ExecutionStatus::parse(&self.status).unwrap_or(ExecutionStatus::Failed),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            retry_count: self.retry_count,
            output: self.output,
        }
    }
}

#[derive(Clone)]
pub struct PostgresRepository {
    store: Store,
}

impl PostgresRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn filter_binds(filter: &JobFilter) -> (Option<bool>, Option<&'static str>, Option<Vec<String>>, Option<String>) {
        let tags = if filter.tags.is_empty() {
            None
        } else {
            Some(filter.tags.clone())
        };
        (
            filter.is_active,
            filter.job_type.map(|t| t.as_str()),
            tags,
            filter.search.clone(),
        )
    }
}

#[async_trait]
impl JobRepository for PostgresRepository {
    async fn find_all(
        &self,
        page: u32,
        limit: u32,
        filter: &JobFilter,
    ) -> Result<(Vec<Job>, u64)> {
        let (is_active, job_type, tags, search) = Self::filter_binds(filter);

        let count_sql = "SELECT COUNT(*) FROM jobs \
             WHERE ($1::boolean IS NULL OR is_active = $1) \
               AND ($2::text IS NULL OR job_type = $2) \
               AND ($3::text[] IS NULL OR tags && $3) \
               AND ($4::text IS NULL OR name ILIKE '%' || $4 || '%')";
        let total: i64 = self
            .store
            .timed("jobs.count", async {
                sqlx::query_scalar(count_sql)
                    .bind(is_active)
                    .bind(job_type)
                    .bind(tags.clone())
                    .bind(search.clone())
                    .fetch_one(self.store.pool())
                    .await
            })
            .await?;

        let page_sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::boolean IS NULL OR is_active = $1) \
               AND ($2::text IS NULL OR job_type = $2) \
               AND ($3::text[] IS NULL OR tags && $3) \
               AND ($4::text IS NULL OR name ILIKE '%' || $4 || '%') \
             ORDER BY created_at DESC LIMIT $5 OFFSET $6"
        );
        let rows: Vec<JobRow> = self
            .store
            .timed("jobs.page", async {
                sqlx::query_as(&page_sql)
                    .bind(is_active)
                    .bind(job_type)
                    .bind(tags)
                    .bind(search)
                    .bind(limit as i64)
                    .bind(offset_for(page, limit) as i64)
                    .fetch_all(self.store.pool())
                    .await
            })
            .await?;

        Ok((
            rows.into_iter().map(JobRow::into_job).collect(),
            total as u64,
        ))
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = self
            .store
            .timed("jobs.find_by_id", async {
                sqlx::query_as(&sql).bind(id).fetch_optional(self.store.pool()).await
            })
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    async fn create(&self, input: NewJob) -> Result<Job> {
        let details = input.validate();
        if !details.is_empty() {
            return Err(CronworkError::validation(details));
        }
        // Validation above guarantees both fields are present and the
        // expression parses.
        let name = input.name.as_deref().unwrap_or_default();
        let cron_expression = input.cron_expression.as_deref().unwrap_or_default();
        let next_run_at = CronExpr::parse(cron_expression)
            .map(|expr| expr.next_after(Utc::now()))
            .ok();

        let sql = format!(
            "INSERT INTO jobs (name, description, cron_expression, is_active, job_type, \
             payload, timeout_ms, max_retries, retry_delay_ms, created_by, tags, next_run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = self
            .store
            .timed("jobs.insert", async {
                sqlx::query_as(&sql)
                    .bind(name)
                    .bind(&input.description)
                    .bind(cron_expression)
                    .bind(input.is_active)
                    .bind(input.job_type.as_str())
                    .bind(&input.payload)
                    .bind(input.timeout_ms)
                    .bind(input.max_retries)
                    .bind(input.retry_delay_ms)
                    .bind(&input.created_by)
                    .bind(input.normalized_tags())
                    .bind(next_run_at)
                    .fetch_one(self.store.pool())
                    .await
            })
            .await?;
        Ok(row.into_job())
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<Job>> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let recompute = patch.changes_cron(&existing);
        let mut merged = patch.apply(&existing).map_err(CronworkError::validation)?;
        if recompute {
            if let Ok(expr) = CronExpr::parse(&merged.cron_expression) {
                merged.next_run_at = Some(expr.next_after(Utc::now()));
            }
        }

        let sql = format!(
            "UPDATE jobs SET name = $1, description = $2, cron_expression = $3, \
             is_active = $4, job_type = $5, payload = $6, timeout_ms = $7, \
             max_retries = $8, retry_delay_ms = $9, tags = $10, next_run_at = $11, \
             updated_at = NOW() WHERE id = $12 RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = self
            .store
            .timed("jobs.update", async {
                sqlx::query_as(&sql)
                    .bind(&merged.name)
                    .bind(&merged.description)
                    .bind(&merged.cron_expression)
                    .bind(merged.is_active)
                    .bind(merged.job_type.as_str())
                    .bind(&merged.payload)
                    .bind(merged.timeout_ms)
                    .bind(merged.max_retries)
                    .bind(merged.retry_delay_ms)
                    .bind(&merged.tags)
                    .bind(merged.next_run_at)
                    .bind(id)
                    .fetch_optional(self.store.pool())
                    .await
            })
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("DELETE FROM jobs WHERE id = $1 RETURNING {JOB_COLUMNS}");
        let row: Option<JobRow> = self
            .store
            .timed("jobs.delete", async {
                sqlx::query_as(&sql).bind(id).fetch_optional(self.store.pool()).await
            })
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    async fn update_job_stats(&self, id: JobId, success: bool) -> Result<()> {
        // Single statement so the counters cannot drift under partial failure.
        self.store
            .timed("jobs.update_stats", async {
                sqlx::query(
                    "UPDATE jobs SET \
                     total_runs = total_runs + 1, \
                     successful_runs = successful_runs + CASE WHEN $2 THEN 1 ELSE 0 END, \
                     failed_runs = failed_runs + CASE WHEN $2 THEN 0 ELSE 1 END, \
                     last_run_at = NOW(), updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(success)
                .execute(self.store.pool())
                .await
            })
            .await?;
        Ok(())
    }

    async fn set_next_run(&self, id: JobId, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        self.store
            .timed("jobs.set_next_run", async {
                sqlx::query("UPDATE jobs SET next_run_at = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(next_run_at)
                    .execute(self.store.pool())
                    .await
            })
            .await?;
        Ok(())
    }

    async fn get_active_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE is_active \
             ORDER BY next_run_at ASC NULLS FIRST LIMIT $1"
        );
        let rows: Vec<JobRow> = self
            .store
            .timed("jobs.active", async {
                sqlx::query_as(&sql).bind(limit).fetch_all(self.store.pool()).await
            })
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    async fn insert_execution(&self, job_id: JobId, retry_count: i32) -> Result<JobExecution> {
        let sql = format!(
            "INSERT INTO job_executions (job_id, status, retry_count) \
             VALUES ($1, 'running', $2) RETURNING {EXECUTION_COLUMNS}"
        );
        let row: ExecutionRow = self
            .store
            .timed("executions.insert", async {
                sqlx::query_as(&sql)
                    .bind(job_id)
                    .bind(retry_count)
                    .fetch_one(self.store.pool())
                    .await
            })
            .await?;
        Ok(row.into_execution())
    }

    async fn finish_execution(
        &self,
        execution: &JobExecution,
        status: ExecutionStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - execution.started_at).num_milliseconds();
        self.store
            .timed("executions.finish", async {
                sqlx::query(
                    "UPDATE job_executions SET status = $1, completed_at = $2, \
                     duration_ms = $3, error_message = $4, output = $5 \
                     WHERE id = $6 AND started_at = $7 AND status = 'running'",
                )
                .bind(status.as_str())
                .bind(completed_at)
                .bind(duration_ms)
                .bind(&error_message)
                .bind(&output)
                .bind(execution.id)
                .bind(execution.started_at)
                .execute(self.store.pool())
                .await
            })
            .await?;
        Ok(())
    }

    async fn find_executions(
        &self,
        job_id: JobId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<JobExecution>, u64)> {
        let total: i64 = self
            .store
            .timed("executions.count", async {
                sqlx::query_scalar("SELECT COUNT(*) FROM job_executions WHERE job_id = $1")
                    .bind(job_id)
                    .fetch_one(self.store.pool())
                    .await
            })
            .await?;

        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE job_id = $1 \
             ORDER BY started_at DESC LIMIT $2 OFFSET $3"
        );
        let rows: Vec<ExecutionRow> = self
            .store
            .timed("executions.page", async {
                sqlx::query_as(&sql)
                    .bind(job_id)
                    .bind(limit as i64)
                    .bind(offset_for(page, limit) as i64)
                    .fetch_all(self.store.pool())
                    .await
            })
            .await?;

        Ok((
            rows.into_iter().map(ExecutionRow::into_execution).collect(),
            total as u64,
        ))
    }

    async fn reconcile_orphaned_executions(&self, grace: Duration) -> Result<u64> {
        // One statement for the terminal write and the counter bump, so a
        // reconciled failure is never invisible in the job's statistics.
        let reconciled: i64 = self
            .store
            .timed("executions.reconcile", async {
                sqlx::query_scalar(
                    "WITH reconciled AS ( \
                         UPDATE job_executions e SET status = 'failed', \
                         completed_at = NOW(), \
                         duration_ms = (EXTRACT(EPOCH FROM (NOW() - e.started_at)) * 1000)::bigint, \
                         error_message = 'orphaned: exceeded deadline without a terminal write' \
                         FROM jobs j \
                         WHERE e.job_id = j.id AND e.status = 'running' \
                           AND e.started_at < NOW() - (j.timeout_ms + $1) * INTERVAL '1 millisecond' \
                         RETURNING e.job_id \
                     ), counted AS ( \
                         SELECT job_id, COUNT(*) AS failures FROM reconciled GROUP BY job_id \
                     ), bumped AS ( \
                         UPDATE jobs SET \
                         total_runs = total_runs + counted.failures, \
                         failed_runs = failed_runs + counted.failures, \
                         updated_at = NOW() \
                         FROM counted WHERE jobs.id = counted.job_id \
                         RETURNING counted.failures \
                     ) \
                     SELECT COALESCE(SUM(failures), 0)::bigint FROM bumped",
                )
                .bind(grace.num_milliseconds())
                .fetch_one(self.store.pool())
                .await
            })
            .await?;
        Ok(reconciled as u64)
    }

    async fn run_maintenance(&self) -> Result<()> {
        migrations::ensure_execution_partitions(&self.store).await
    }

    async fn database_stats(&self) -> Result<DatabaseStats> {
        let (total_jobs, active_jobs): (i64, i64) = self
            .store
            .timed("stats.jobs", async {
                sqlx::query_as(
                    "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active) FROM jobs",
                )
                .fetch_one(self.store.pool())
                .await
            })
            .await?;

        let (total_executions, recent_executions): (i64, i64) = self
            .store
            .timed("stats.executions", async {
                sqlx::query_as(
                    "SELECT COUNT(*), \
                     COUNT(*) FILTER (WHERE started_at > NOW() - INTERVAL '24 hours') \
                     FROM job_executions",
                )
                .fetch_one(self.store.pool())
                .await
            })
            .await?;

        let by_type: Vec<(String, i64)> = self
            .store
            .timed("stats.by_type", async {
                sqlx::query_as("SELECT job_type, COUNT(*) FROM jobs GROUP BY job_type")
                    .fetch_all(self.store.pool())
                    .await
            })
            .await?;

        Ok(DatabaseStats {
            total_jobs,
            active_jobs,
            total_executions,
            recent_executions,
            jobs_by_type: by_type.into_iter().collect::<HashMap<_, _>>(),
            calculated_at: Utc::now(),
        })
    }
}
