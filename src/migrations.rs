//! Versioned schema migrations for the jobs and execution-history tables.
//!
//! Migrations are tracked in `_cronwork_migrations` and applied at most once,
//! in version order, each inside its own transaction. The execution-history
//! table is range-partitioned by month of `started_at`; partitions for the
//! current and following month are ensured after migrating and again on every
//! scheduler sync tick.

use crate::store::Store;
use crate::Result;
use std::time::Instant;
use tracing::{debug, info};

pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub version: i32,
    statements: &'static [&'static str],
}

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name VARCHAR(255) NOT NULL CHECK (length(name) > 0),
    description VARCHAR(1000),
    cron_expression VARCHAR(100) NOT NULL
        CHECK (cron_expression ~ '^\s*\S+\s+\S+\s+\S+\s+\S+\s+\S+\s*$'),
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    job_type VARCHAR(20) NOT NULL DEFAULT 'scheduled'
        CHECK (job_type IN ('scheduled', 'immediate', 'recurring', 'delayed')),
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    timeout_ms INTEGER NOT NULL DEFAULT 30000
        CHECK (timeout_ms BETWEEN 1000 AND 300000),
    max_retries INTEGER NOT NULL DEFAULT 3
        CHECK (max_retries BETWEEN 0 AND 10),
    retry_delay_ms INTEGER NOT NULL DEFAULT 5000
        CHECK (retry_delay_ms BETWEEN 1000 AND 60000),
    created_by VARCHAR(255) NOT NULL DEFAULT '',
    tags TEXT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_run_at TIMESTAMPTZ,
    next_run_at TIMESTAMPTZ,
    total_runs BIGINT NOT NULL DEFAULT 0 CHECK (total_runs >= 0),
    successful_runs BIGINT NOT NULL DEFAULT 0 CHECK (successful_runs >= 0),
    failed_runs BIGINT NOT NULL DEFAULT 0 CHECK (failed_runs >= 0)
)
"#;

const CREATE_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_executions (
    id UUID NOT NULL DEFAULT gen_random_uuid(),
    job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    status VARCHAR(20) NOT NULL DEFAULT 'running'
        CHECK (status IN ('running', 'completed', 'failed', 'timeout')),
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    duration_ms BIGINT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    output JSONB,
    PRIMARY KEY (id, started_at)
) PARTITION BY RANGE (started_at)
"#;

// Catch-all so a missed monthly partition never loses an execution row.
const CREATE_EXECUTIONS_DEFAULT_PARTITION: &str = r#"
CREATE TABLE IF NOT EXISTS job_executions_default
    PARTITION OF job_executions DEFAULT
"#;

const CREATE_PARTITION_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION ensure_executions_partition(month_start DATE)
RETURNS VOID AS $$
DECLARE
    part_name TEXT := 'job_executions_' || to_char(month_start, 'YYYY_MM');
    range_start TIMESTAMPTZ := date_trunc('month', month_start::timestamptz);
    range_end TIMESTAMPTZ := range_start + INTERVAL '1 month';
BEGIN
    EXECUTE format(
        'CREATE TABLE IF NOT EXISTS %I PARTITION OF job_executions FOR VALUES FROM (%L) TO (%L)',
        part_name, range_start, range_end
    );
END;
$$ LANGUAGE plpgsql
"#;

const CREATE_CLEANUP_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION cleanup_old_executions(retention_days INTEGER)
RETURNS BIGINT AS $$
DECLARE
    removed BIGINT;
BEGIN
    DELETE FROM job_executions
    WHERE started_at < NOW() - make_interval(days => retention_days);
    GET DIAGNOSTICS removed = ROW_COUNT;
    RETURN removed;
END;
$$ LANGUAGE plpgsql
"#;

const MIGRATIONS: &[Migration] = &[Migration {
    id: "001_initial_schema",
    description: "jobs table, partitioned execution history, maintenance functions",
    version: 1,
    statements: &[
        CREATE_JOBS_TABLE,
        "CREATE INDEX IF NOT EXISTS idx_jobs_next_run \
         ON jobs (next_run_at, is_active) WHERE is_active",
        "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_job_type ON jobs (job_type)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_tags ON jobs USING GIN (tags)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_payload ON jobs USING GIN (payload)",
        CREATE_EXECUTIONS_TABLE,
        CREATE_EXECUTIONS_DEFAULT_PARTITION,
        "CREATE INDEX IF NOT EXISTS idx_job_executions_job_id \
         ON job_executions (job_id, started_at DESC)",
        CREATE_PARTITION_FUNCTION,
        CREATE_CLEANUP_FUNCTION,
    ],
}];

/// Apply all pending migrations, then ensure the near-term partitions exist.
pub async fn run(store: &Store) -> Result<()> {
    let pool = store.pool();

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _cronwork_migrations (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            execution_time_ms BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let executed: Vec<(String,)> = sqlx::query_as("SELECT id FROM _cronwork_migrations")
        .fetch_all(pool)
        .await?;

    let mut pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| !executed.iter().any(|(id,)| id == m.id))
        .collect();
    pending.sort_by_key(|m| m.version);

    if pending.is_empty() {
        debug!("schema is up to date");
    }

    for migration in pending {
        let started = Instant::now();
        let mut tx = pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        let elapsed_ms = started.elapsed().as_millis() as i64;
        sqlx::query(
            "INSERT INTO _cronwork_migrations (id, version, execution_time_ms) \
             VALUES ($1, $2, $3)",
        )
        .bind(migration.id)
        .bind(migration.version)
        .bind(elapsed_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(
            id = migration.id,
            elapsed_ms, "applied migration: {}", migration.description
        );
    }

    ensure_execution_partitions(store).await
}

/// Create the execution-history partitions for the current and next month.
pub async fn ensure_execution_partitions(store: &Store) -> Result<()> {
    let pool = store.pool();
    sqlx::query("SELECT ensure_executions_partition(date_trunc('month', now())::date)")
        .execute(pool)
        .await?;
    sqlx::query(
        "SELECT ensure_executions_partition(\
         (date_trunc('month', now()) + interval '1 month')::date)",
    )
    .execute(pool)
    .await?;
    Ok(())
}
