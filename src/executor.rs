//! Pluggable job execution seam.
//!
//! The engine schedules and accounts for work; what a firing actually does is
//! behind [`JobExecutor`]. The default implementation simulates work: it
//! sleeps briefly and echoes the payload back as the execution output.

use crate::job::Job;
use crate::{CronworkError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Perform the work for one firing. The scheduler applies the job's
    /// deadline around this call; implementations just do the work.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value>;
}

/// Simulated work: sleeps 100-500 ms (derived from the job id, so a given
/// job is stable across firings) and echoes the payload.
///
/// Payload knobs, for exercising the engine end-to-end:
/// - `"simulateDurationMs"`: overrides the sleep.
/// - `"simulateFailure": true`: fail the execution.
#[derive(Debug, Default, Clone)]
pub struct SimulatedExecutor;

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self
    }

    fn duration_for(job: &Job) -> Duration {
        if let Some(ms) = job
            .payload
            .get("simulateDurationMs")
            .and_then(serde_json::Value::as_u64)
        {
            return Duration::from_millis(ms);
        }
        let bytes = job.id.as_bytes();
        let seed = u64::from_le_bytes(bytes[..8].try_into().expect("uuid is 16 bytes"));
        Duration::from_millis(100 + seed % 401)
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value> {
        let duration = Self::duration_for(job);
        tokio::time::sleep(duration).await;

        if job
            .payload
            .get("simulateFailure")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return Err(CronworkError::Executor {
                message: format!("simulated failure for job '{}'", job.name),
            });
        }

        Ok(json!({
            "jobId": job.id,
            "jobName": job.name,
            "jobType": job.job_type.as_str(),
            "message": format!("simulated {} job run", job.job_type.as_str()),
            "echo": job.payload,
            "simulatedDurationMs": duration.as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobType};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn job_with_payload(payload: serde_json::Value) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "sim".to_string(),
            description: None,
            cron_expression: "* * * * *".to_string(),
            is_active: true,
            job_type: JobType::Immediate,
            payload,
            timeout_ms: 30_000,
            max_retries: 0,
            retry_delay_ms: 1000,
            created_by: "tests".to_string(),
            tags: vec![],
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn echoes_payload_with_type_label() {
        let executor = SimulatedExecutor::new();
        let job = job_with_payload(json!({"k": "v"}));
        let output = executor.execute(&job).await.unwrap();
        assert_eq!(output["jobType"], "immediate");
        assert_eq!(output["echo"], json!({"k": "v"}));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_flag_fails_the_run() {
        let executor = SimulatedExecutor::new();
        let job = job_with_payload(json!({"simulateFailure": true}));
        let err = executor.execute(&job).await.unwrap_err();
        assert!(err.to_string().contains("simulated failure"));
    }

    #[test]
    fn duration_is_stable_per_job() {
        let job = job_with_payload(json!({}));
        assert_eq!(
            SimulatedExecutor::duration_for(&job),
            SimulatedExecutor::duration_for(&job)
        );
        let d = SimulatedExecutor::duration_for(&job);
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(500));

        let fixed = job_with_payload(json!({"simulateDurationMs": 1234}));
        assert_eq!(
            SimulatedExecutor::duration_for(&fixed),
            Duration::from_millis(1234)
        );
    }
}
