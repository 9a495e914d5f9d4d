//! The scheduling engine: one timer per active job, single-flight execution,
//! timeout enforcement, retry backoff, and periodic resync against the store.
//!
//! The scheduler is the single writer for execution history. Timers and the
//! sync loop run as tokio tasks; all shared state lives behind short-lived
//! locks that are never held across a store call.

use crate::cron::CronExpr;
use crate::executor::JobExecutor;
use crate::job::{ExecutionStatus, Job, JobId};
use crate::repository::JobRepository;
use crate::stats::{SchedulerCounters, SchedulerStats};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the store resync loop.
    pub sync_interval: Duration,
    /// How long `stop` waits for in-flight executions to drain.
    pub stop_grace: Duration,
    /// Slack added to a job's timeout before a `running` row counts as
    /// orphaned.
    pub orphan_grace: chrono::Duration,
    /// Cap on jobs loaded at start and on each sync.
    pub max_jobs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(30),
            orphan_grace: chrono::Duration::seconds(60),
            max_jobs: crate::repository::MAX_ACTIVE_JOBS,
        }
    }
}

#[derive(Debug, Clone)]
struct ExecutionContext {
    execution_id: Option<uuid::Uuid>,
    started_at: DateTime<Utc>,
}

struct Inner {
    repository: Arc<dyn JobRepository>,
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    counters: SchedulerCounters,
    active: Mutex<HashMap<JobId, JoinHandle<()>>>,
    running: Mutex<HashMap<JobId, ExecutionContext>>,
    is_running: AtomicBool,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the engine; all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Releases a job's single-flight slot on every exit path, panics included.
struct RunningGuard {
    inner: Arc<Inner>,
    job_id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.running.lock() {
            running.remove(&self.job_id);
        }
    }
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                executor,
                config,
                counters: SchedulerCounters::new(),
                active: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                is_running: AtomicBool::new(false),
                sync_handle: Mutex::new(None),
            }),
        }
    }

    /// Load all active jobs, arm a timer for each, and start the sync loop.
    /// Idempotent: a second call while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return Ok(());
        }

        let jobs = match self
            .inner
            .repository
            .get_active_jobs(self.inner.config.max_jobs)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                self.inner.is_running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        for job in &jobs {
            self.schedule_job(job);
        }
        info!(count = jobs.len(), "scheduler started");

        let scheduler = self.clone();
        let sync_interval = self.inner.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the loop below owns the
            // periodic ones.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = scheduler.sync().await {
                    warn!(error = %err, "scheduler sync failed");
                }
            }
        });
        *self.lock_sync_handle() = Some(handle);

        Ok(())
    }

    /// Cancel all timers and the sync loop, then wait up to the stop grace
    /// for in-flight executions to drain.
    pub async fn stop(&self) {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping scheduler");

        if let Some(handle) = self.lock_sync_handle().take() {
            handle.abort();
        }
        for (_, handle) in self.lock_active().drain() {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.stop_grace;
        loop {
            let in_flight = self.running_count();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight,
                    "stop grace expired with executions still in flight"
                );
                break;
            }
            sleep(Duration::from_millis(200)).await;
        }
        info!("scheduler stopped");
    }

    /// Arm (or re-arm) the recurring timer for a job. A malformed cron
    /// expression is logged and the job is left unscheduled.
    pub fn schedule_job(&self, job: &Job) {
        let expr = match CronExpr::parse(&job.cron_expression) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    error = %err,
                    "refusing to schedule job with invalid cron expression"
                );
                return;
            }
        };

        let scheduler = self.clone();
        let job_snapshot = job.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = expr.next_after(now);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(job_id = %job_snapshot.id, next = %next, "timer armed");
                sleep(wait).await;
                // Fired executions are detached tasks so that destroying
                // this timer never interrupts in-flight work.
                scheduler.spawn_execution(job_snapshot.clone());
            }
        });

        if let Some(previous) = self.lock_active().insert(job.id, handle) {
            previous.abort();
            debug!(job_id = %job.id, "replaced existing timer");
        }
    }

    /// Drop the timer for a job. In-flight executions are not touched.
    pub fn unschedule_job(&self, id: JobId) {
        if let Some(handle) = self.lock_active().remove(&id) {
            handle.abort();
            debug!(job_id = %id, "unscheduled");
        }
    }

    pub fn is_scheduled(&self, id: JobId) -> bool {
        self.lock_active().contains_key(&id)
    }

    /// Run one execution as a detached task (manual triggers).
    pub fn spawn_execution(&self, job: Job) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.execute_job(&job, 0).await {
                warn!(job_id = %job.id, error = %err, "triggered execution failed");
            }
        });
    }

    /// Execute one firing of a job: at most one concurrent execution per job,
    /// a provisional history row before work starts, the deadline from
    /// `timeout_ms`, and a terminal write plus counter updates afterwards.
    ///
    /// Store failures after the provisional row exists are logged and
    /// swallowed so one bad write never tears down the timer.
    pub async fn execute_job(&self, job: &Job, retry_count: i32) -> Result<()> {
        // Reserve the single-flight slot before the first await so two
        // concurrent fires cannot both pass the check.
        {
            let mut running = self.lock_running();
            if let Some(context) = running.get(&job.id) {
                debug!(
                    job_id = %job.id,
                    in_flight = ?context.execution_id,
                    since = %context.started_at,
                    "execution already in flight, fire skipped"
                );
                return Ok(());
            }
            running.insert(
                job.id,
                ExecutionContext {
                    execution_id: None,
                    started_at: Utc::now(),
                },
            );
        }
        let _guard = RunningGuard {
            inner: self.inner.clone(),
            job_id: job.id,
        };

        let execution = match self.inner.repository.insert_execution(job.id, retry_count).await {
            Ok(execution) => execution,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "could not record execution start");
                return Err(err);
            }
        };
        if let Some(context) = self.lock_running().get_mut(&job.id) {
            context.execution_id = Some(execution.id);
            context.started_at = execution.started_at;
        }

        debug!(job_id = %job.id, execution_id = %execution.id, retry_count, "executing job");
        let deadline = Duration::from_millis(job.timeout_ms.max(0) as u64);
        let outcome = tokio::time::timeout(deadline, self.inner.executor.execute(job)).await;

        let (status, error_message, output) = match outcome {
            Ok(Ok(output)) => (ExecutionStatus::Completed, None, Some(output)),
            Ok(Err(err)) => (ExecutionStatus::Failed, Some(err.to_string()), None),
            Err(_) => (
                ExecutionStatus::Timeout,
                Some(
                    crate::CronworkError::ExecutionTimeout {
                        timeout_ms: job.timeout_ms as i64,
                    }
                    .to_string(),
                ),
                None,
            ),
        };
        let success = status == ExecutionStatus::Completed;
        let duration_ms = (Utc::now() - execution.started_at).num_milliseconds();

        if let Err(err) = self
            .inner
            .repository
            .finish_execution(&execution, status, error_message.clone(), output)
            .await
        {
            error!(job_id = %job.id, error = %err, "could not record execution result");
        }
        if let Err(err) = self.inner.repository.update_job_stats(job.id, success).await {
            error!(job_id = %job.id, error = %err, "could not update job counters");
        }
        // next_run_at is recomputed after every completion, success or not.
        if let Ok(expr) = CronExpr::parse(&job.cron_expression) {
            let next = expr.next_after(Utc::now());
            if let Err(err) = self.inner.repository.set_next_run(job.id, Some(next)).await {
                error!(job_id = %job.id, error = %err, "could not persist next run");
            }
        }
        self.inner.counters.record(success, duration_ms as f64);

        if success {
            info!(job_id = %job.id, duration_ms, "job completed");
        } else {
            warn!(
                job_id = %job.id,
                duration_ms,
                status = status.as_str(),
                error = error_message.as_deref().unwrap_or(""),
                "job failed"
            );
            self.arm_retry(job, retry_count);
        }
        Ok(())
    }

    /// Reconcile the timer set against the store's active jobs, diffing on
    /// `is_active` membership alone. Also fails orphaned execution rows and
    /// runs storage maintenance. Never touches in-flight executions.
    pub async fn sync(&self) -> Result<()> {
        let jobs = self
            .inner
            .repository
            .get_active_jobs(self.inner.config.max_jobs)
            .await?;

        let scheduled: Vec<JobId> = self.lock_active().keys().copied().collect();
        let mut newcomers = 0usize;
        for job in &jobs {
            if !scheduled.contains(&job.id) {
                self.schedule_job(job);
                newcomers += 1;
            }
        }
        let mut removed = 0usize;
        for id in scheduled {
            if !jobs.iter().any(|job| job.id == id) {
                self.unschedule_job(id);
                removed += 1;
            }
        }
        if newcomers > 0 || removed > 0 {
            info!(newcomers, removed, "sync reconciled timer set");
        }

        match self
            .inner
            .repository
            .reconcile_orphaned_executions(self.inner.config.orphan_grace)
            .await
        {
            Ok(0) => {}
            Ok(count) => warn!(count, "reconciled orphaned executions"),
            Err(err) => warn!(error = %err, "orphan reconciliation failed"),
        }
        if let Err(err) = self.inner.repository.run_maintenance().await {
            warn!(error = %err, "storage maintenance failed");
        }

        Ok(())
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot(
            self.inner.is_running.load(Ordering::SeqCst),
            self.active_count(),
            self.running_count(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Arm a delayed retry with linear backoff. Retries count against the
    /// next execution row's `retry_count` and never exceed `max_retries`.
    fn arm_retry(&self, job: &Job, retry_count: i32) {
        if retry_count >= job.max_retries {
            if job.max_retries > 0 {
                warn!(
                    job_id = %job.id,
                    max_retries = job.max_retries,
                    "retries exhausted"
                );
            }
            return;
        }
        let attempt = retry_count + 1;
        let delay = Duration::from_millis(job.retry_delay_ms as u64 * attempt as u64);
        info!(
            job_id = %job.id,
            attempt,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retry armed"
        );
        let scheduler = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = scheduler.execute_job(&job, attempt).await {
                warn!(job_id = %job.id, error = %err, "retry failed to start");
            }
        });
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
        self.inner.active.lock().expect("active lock poisoned")
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<JobId, ExecutionContext>> {
        self.inner.running.lock().expect("running lock poisoned")
    }

    fn lock_sync_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.sync_handle.lock().expect("sync handle lock poisoned")
    }
}
