//! Job and execution value types.
//!
//! [`Job`] is a plain record mirroring the durable `jobs` row; repositories
//! convert rows into it and the control plane serializes it straight onto the
//! wire (camelCase). [`NewJob`] and [`JobPatch`] are the validated write
//! shapes.

use crate::cron::CronExpr;
use crate::error::FieldError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Unique identifier for a job.
pub type JobId = Uuid;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MAX_CREATED_BY_LEN: usize = 255;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_TAGS: usize = 10;
pub const TIMEOUT_MS_RANGE: std::ops::RangeInclusive<i32> = 1000..=300_000;
pub const MAX_RETRIES_RANGE: std::ops::RangeInclusive<i32> = 0..=10;
pub const RETRY_DELAY_MS_RANGE: std::ops::RangeInclusive<i32> = 1000..=60_000;

pub const DEFAULT_TIMEOUT_MS: i32 = 30_000;
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: i32 = 5000;

/// Label-only classification; does not affect scheduling semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Scheduled,
    Immediate,
    Recurring,
    Delayed,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scheduled => "scheduled",
            JobType::Immediate => "immediate",
            JobType::Recurring => "recurring",
            JobType::Delayed => "delayed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobType::Scheduled),
            "immediate" => Some(JobType::Immediate),
            "recurring" => Some(JobType::Recurring),
            "delayed" => Some(JobType::Delayed),
            _ => None,
        }
    }
}

impl Default for JobType {
    fn default() -> Self {
        JobType::Scheduled
    }
}

/// Lifecycle state of a single execution. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// A registered job as persisted in the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub is_active: bool,
    pub job_type: JobType,
    /// Opaque payload; never schema-inferred.
    pub payload: serde_json::Value,
    pub timeout_ms: i32,
    pub max_retries: i32,
    pub retry_delay_ms: i32,
    pub created_by: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
}

/// One attempt to run a job; append-only history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: Uuid,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub output: Option<serde_json::Value>,
}

/// Validated input for job creation.
///
/// `name` and `cron_expression` are required, but deserialization accepts
/// their absence so that a missing key surfaces as a field error from
/// [`NewJob::validate`] rather than a body-level rejection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i32,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_payload() -> serde_json::Value {
    json!({})
}

fn default_timeout_ms() -> i32 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> i32 {
    DEFAULT_RETRY_DELAY_MS
}

impl NewJob {
    /// Check all field constraints; the returned list is empty when valid.
    pub fn validate(&self) -> Vec<FieldError> {
        validate_common(
            self.name.as_deref(),
            self.description.as_deref(),
            self.cron_expression.as_deref(),
            &self.payload,
            self.timeout_ms,
            self.max_retries,
            self.retry_delay_ms,
            &self.created_by,
            &self.tags,
        )
    }

    /// Tags as a normalized set: trimmed of duplicates, original order kept.
    pub fn normalized_tags(&self) -> Vec<String> {
        normalize_tags(&self.tags)
    }
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub is_active: Option<bool>,
    pub job_type: Option<JobType>,
    pub payload: Option<serde_json::Value>,
    pub timeout_ms: Option<i32>,
    pub max_retries: Option<i32>,
    pub retry_delay_ms: Option<i32>,
    pub tags: Option<Vec<String>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.cron_expression.is_none()
            && self.is_active.is_none()
            && self.job_type.is_none()
            && self.payload.is_none()
            && self.timeout_ms.is_none()
            && self.max_retries.is_none()
            && self.retry_delay_ms.is_none()
            && self.tags.is_none()
    }

    /// Whether applying this patch would change the cron expression of `job`.
    pub fn changes_cron(&self, job: &Job) -> bool {
        match &self.cron_expression {
            Some(expr) => expr != &job.cron_expression,
            None => false,
        }
    }

    /// Merge onto an existing job, re-validating the merged result.
    /// `updated_at` is bumped; counters and run bookkeeping are untouched.
    pub fn apply(&self, job: &Job) -> Result<Job, Vec<FieldError>> {
        let mut merged = job.clone();
        if let Some(name) = &self.name {
            merged.name = name.clone();
        }
        if let Some(description) = &self.description {
            merged.description = Some(description.clone());
        }
        if let Some(expr) = &self.cron_expression {
            merged.cron_expression = expr.clone();
        }
        if let Some(is_active) = self.is_active {
            merged.is_active = is_active;
        }
        if let Some(job_type) = self.job_type {
            merged.job_type = job_type;
        }
        if let Some(payload) = &self.payload {
            merged.payload = payload.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            merged.timeout_ms = timeout_ms;
        }
        if let Some(max_retries) = self.max_retries {
            merged.max_retries = max_retries;
        }
        if let Some(retry_delay_ms) = self.retry_delay_ms {
            merged.retry_delay_ms = retry_delay_ms;
        }
        if let Some(tags) = &self.tags {
            merged.tags = normalize_tags(tags);
        }
        merged.updated_at = Utc::now();

        let details = validate_common(
            Some(&merged.name),
            merged.description.as_deref(),
            Some(&merged.cron_expression),
            &merged.payload,
            merged.timeout_ms,
            merged.max_retries,
            merged.retry_delay_ms,
            &merged.created_by,
            &merged.tags,
        );
        if details.is_empty() {
            Ok(merged)
        } else {
            Err(details)
        }
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(tags.len());
    for tag in tags {
        if !seen.contains(tag) {
            seen.push(tag.clone());
        }
    }
    seen
}

#[allow(clippy::too_many_arguments)]
fn validate_common(
    name: Option<&str>,
    description: Option<&str>,
    cron_expression: Option<&str>,
    payload: &serde_json::Value,
    timeout_ms: i32,
    max_retries: i32,
    retry_delay_ms: i32,
    created_by: &str,
    tags: &[String],
) -> Vec<FieldError> {
    let mut details = Vec::new();

    match name {
        None => details.push(FieldError::new("name", "name is required", json!(null))),
        Some("") => {
            details.push(FieldError::new("name", "name must not be empty", json!("")))
        }
        Some(name) if name.len() > MAX_NAME_LEN => details.push(FieldError::new(
            "name",
            format!("name must be at most {MAX_NAME_LEN} characters"),
            json!(name),
        )),
        Some(_) => {}
    }

    if let Some(description) = description {
        if description.len() > MAX_DESCRIPTION_LEN {
            details.push(FieldError::new(
                "description",
                format!("description must be at most {MAX_DESCRIPTION_LEN} characters"),
                json!(description),
            ));
        }
    }

    match cron_expression {
        None => details.push(FieldError::new(
            "cronExpression",
            "cronExpression is required",
            json!(null),
        )),
        Some(expression) => {
            if let Err(err) = CronExpr::parse(expression) {
                details.push(FieldError::new(
                    "cronExpression",
                    err.to_string(),
                    json!(expression),
                ));
            }
        }
    }

    if !payload.is_object() {
        details.push(FieldError::new(
            "payload",
            "payload must be a JSON object",
            payload.clone(),
        ));
    }

    if !TIMEOUT_MS_RANGE.contains(&timeout_ms) {
        details.push(FieldError::new(
            "timeoutMs",
            format!(
                "timeoutMs must be between {} and {}",
                TIMEOUT_MS_RANGE.start(),
                TIMEOUT_MS_RANGE.end()
            ),
            json!(timeout_ms),
        ));
    }

    if !MAX_RETRIES_RANGE.contains(&max_retries) {
        details.push(FieldError::new(
            "maxRetries",
            format!(
                "maxRetries must be between {} and {}",
                MAX_RETRIES_RANGE.start(),
                MAX_RETRIES_RANGE.end()
            ),
            json!(max_retries),
        ));
    }

    if !RETRY_DELAY_MS_RANGE.contains(&retry_delay_ms) {
        details.push(FieldError::new(
            "retryDelayMs",
            format!(
                "retryDelayMs must be between {} and {}",
                RETRY_DELAY_MS_RANGE.start(),
                RETRY_DELAY_MS_RANGE.end()
            ),
            json!(retry_delay_ms),
        ));
    }

    if created_by.len() > MAX_CREATED_BY_LEN {
        details.push(FieldError::new(
            "createdBy",
            format!("createdBy must be at most {MAX_CREATED_BY_LEN} characters"),
            json!(created_by),
        ));
    }

    if tags.len() > MAX_TAGS {
        details.push(FieldError::new(
            "tags",
            format!("at most {MAX_TAGS} tags are allowed"),
            json!(tags),
        ));
    }
    for tag in tags {
        if tag.is_empty() || tag.len() > MAX_TAG_LEN {
            details.push(FieldError::new(
                "tags",
                format!("each tag must be 1 to {MAX_TAG_LEN} characters"),
                json!(tag),
            ));
        }
    }

    details
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_new_job() -> NewJob {
        NewJob {
            name: Some("tick".to_string()),
            description: None,
            cron_expression: Some("* * * * *".to_string()),
            is_active: true,
            job_type: JobType::Scheduled,
            payload: json!({}),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            created_by: "alice".to_string(),
            tags: vec![],
        }
    }

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "tick".to_string(),
            description: None,
            cron_expression: "* * * * *".to_string(),
            is_active: true,
            job_type: JobType::Scheduled,
            payload: json!({}),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            created_by: "alice".to_string(),
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

    #[test]
    fn valid_input_passes() {
        assert!(valid_new_job().validate().is_empty());
    }

    #[test]
    fn empty_name_and_bad_cron_both_reported() {
        let mut input = valid_new_job();
        input.name = Some(String::new());
        input.cron_expression = Some("bogus".to_string());
        let details = input.validate();
        let fields: Vec<&str> = details.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"cronExpression"));
    }

    #[test]
    fn missing_name_and_cron_are_field_errors() {
        // An empty body deserializes; the absent keys surface as details.
        let input: NewJob = serde_json::from_value(json!({})).unwrap();
        let details = input.validate();
        let name = details.iter().find(|d| d.field == "name").unwrap();
        assert_eq!(name.message, "name is required");
        assert_eq!(name.value, json!(null));
        let cron = details.iter().find(|d| d.field == "cronExpression").unwrap();
        assert_eq!(cron.message, "cronExpression is required");
        assert_eq!(cron.value, json!(null));
    }

    #[test]
    fn timeout_bounds_are_inclusive() {
        let mut input = valid_new_job();
        for (value, ok) in [(999, false), (1000, true), (300_000, true), (300_001, false)] {
            input.timeout_ms = value;
            assert_eq!(input.validate().is_empty(), ok, "timeout_ms={value}");
        }
    }

    #[test]
    fn retry_bounds() {
        let mut input = valid_new_job();
        input.max_retries = 11;
        assert!(!input.validate().is_empty());
        input.max_retries = 0;
        input.retry_delay_ms = 999;
        assert!(!input.validate().is_empty());
    }

    #[test]
    fn payload_must_be_an_object() {
        let mut input = valid_new_job();
        input.payload = json!([1, 2, 3]);
        let details = input.validate();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].field, "payload");
    }

    #[test]
    fn tags_are_bounded_and_deduplicated() {
        let mut input = valid_new_job();
        input.tags = (0..11).map(|i| format!("tag-{i}")).collect();
        assert!(!input.validate().is_empty());

        input.tags = vec!["a".into(), "b".into(), "a".into()];
        assert_eq!(input.normalized_tags(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn patch_merges_and_revalidates() {
        let job = sample_job();
        let patch = JobPatch {
            cron_expression: Some("*/5 * * * *".to_string()),
            is_active: Some(false),
            ..Default::default()
        };
        assert!(patch.changes_cron(&job));
        let merged = patch.apply(&job).unwrap();
        assert_eq!(merged.cron_expression, "*/5 * * * *");
        assert!(!merged.is_active);
        assert!(merged.updated_at >= job.updated_at);

        let bad = JobPatch {
            timeout_ms: Some(1),
            ..Default::default()
        };
        let details = bad.apply(&job).unwrap_err();
        assert_eq!(details[0].field, "timeoutMs");
    }

    #[test]
    fn new_job_deserializes_with_defaults() {
        let input: NewJob = serde_json::from_value(json!({
            "name": "tick",
            "cronExpression": "* * * * *",
            "createdBy": "alice"
        }))
        .unwrap();
        assert!(input.is_active);
        assert_eq!(input.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(input.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(input.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(input.job_type, JobType::Scheduled);
        assert!(input.validate().is_empty());
    }

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[test]
    fn job_serializes_camel_case() {
        let value = serde_json::to_value(sample_job()).unwrap();
        assert!(value.get("cronExpression").is_some());
        assert!(value.get("isActive").is_some());
        assert!(value.get("nextRunAt").is_some());
        assert!(value.get("totalRuns").is_some());
        assert!(value.get("cron_expression").is_none());
    }
}
