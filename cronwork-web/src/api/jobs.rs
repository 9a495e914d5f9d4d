//! Job management endpoints: CRUD, manual triggers, execution history,
//! statistics, and cron validation.

use super::{
    ok_body, parse_job_id, with_context, with_deadline, ApiError, AppContext, PageQuery,
    PaginationMeta,
};
use chrono::Utc;
use cronwork::cache::{DETAIL_TTL, LIST_TTL};
use cronwork::cron::{CronExpr, TIMEZONE};
use cronwork::repository::MAX_PAGE_LIMIT;
use cronwork::{FieldError, JobFilter, JobPatch, JobRepository, JobType, NewJob};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Query parameters accepted by `GET /jobs`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub is_active: Option<bool>,
    pub job_type: Option<String>,
    /// Comma-separated tag list.
    pub tags: Option<String>,
    pub search: Option<String>,
    /// `true` bypasses the response cache.
    pub fresh: Option<bool>,
}

/// `expression` is required; absence is reported as a field error rather
/// than a body-level rejection.
#[derive(Debug, Default, Deserialize)]
pub struct CronValidateRequest {
    #[serde(default)]
    pub expression: Option<String>,
}

pub fn routes(
    ctx: AppContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("jobs")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and(warp::query::<ListJobsQuery>())
        .and_then(list_jobs_handler);

    // Must precede the `/jobs/:id` routes so "stats" is not read as an id.
    let stats = warp::path!("jobs" / "stats")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(stats_handler);

    let validate_cron = warp::path!("jobs" / "validate-cron")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(validate_cron_handler);

    let create = warp::path!("jobs")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(warp::body::json())
        .and_then(create_job_handler);

    let get = warp::path!("jobs" / String)
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(get_job_handler);

    let update = warp::path!("jobs" / String)
        .and(warp::put())
        .and(with_context(ctx.clone()))
        .and(warp::body::json())
        .and_then(update_job_handler);

    let delete = warp::path!("jobs" / String)
        .and(warp::delete())
        .and(with_context(ctx.clone()))
        .and_then(delete_job_handler);

    let trigger = warp::path!("jobs" / String / "trigger")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and_then(trigger_job_handler);

    let executions = warp::path!("jobs" / String / "executions")
        .and(warp::get())
        .and(with_context(ctx))
        .and(warp::query::<PageQuery>())
        .and_then(list_executions_handler);

    stats
        .or(validate_cron)
        .or(list)
        .or(create)
        .or(trigger)
        .or(executions)
        .or(get)
        .or(update)
        .or(delete)
}

fn reply(status: StatusCode, body: Value) -> impl Reply {
    warp::reply::with_status(warp::reply::json(&body), status)
}

/// Validate and normalize `GET /jobs` query parameters.
fn parse_list_query(query: ListJobsQuery) -> Result<(u32, u32, JobFilter, bool), ApiError> {
    let mut details = Vec::new();

    let page = query.page.unwrap_or(1);
    if page < 1 {
        details.push(FieldError::new("page", "page must be at least 1", json!(query.page)));
    }

    let limit = query.limit.unwrap_or(50);
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        details.push(FieldError::new(
            "limit",
            format!("limit must be between 1 and {MAX_PAGE_LIMIT}"),
            json!(query.limit),
        ));
    }

    let job_type = match &query.job_type {
        Some(raw) => match JobType::parse(raw) {
            Some(job_type) => Some(job_type),
            None => {
                details.push(FieldError::new(
                    "jobType",
                    "jobType must be one of scheduled, immediate, recurring, delayed",
                    json!(raw),
                ));
                None
            }
        },
        None => None,
    };

    if let Some(search) = &query.search {
        if search.len() > 255 {
            details.push(FieldError::new(
                "search",
                "search must be at most 255 characters",
                json!(search),
            ));
        }
    }

    if !details.is_empty() {
        return Err(ApiError::Validation(details));
    }

    let tags = query
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let filter = JobFilter {
        is_active: query.is_active,
        job_type,
        tags,
        search: query.search,
    };
    Ok((page, limit, filter, query.fresh.unwrap_or(false)))
}

/// Refresh run bookkeeping and counters on a cached list document. The rest
/// of the cached fields stay as cached; errors degrade to stale data.
async fn overlay_live_fields(repository: &Arc<dyn JobRepository>, data: &mut Value) {
    let Some(jobs) = data.get_mut("jobs").and_then(Value::as_array_mut) else {
        return;
    };
    for job_doc in jobs {
        let is_active = job_doc
            .get("isActive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !is_active {
            continue;
        }
        let Some(id) = job_doc
            .get("id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<Uuid>().ok())
        else {
            continue;
        };
        if let Ok(Some(job)) = repository.find_by_id(id).await {
            job_doc["lastRunAt"] = json!(job.last_run_at);
            job_doc["nextRunAt"] = json!(job.next_run_at);
            job_doc["totalRuns"] = json!(job.total_runs);
            job_doc["successfulRuns"] = json!(job.successful_runs);
            job_doc["failedRuns"] = json!(job.failed_runs);
        }
    }
}

async fn list_jobs_handler(
    ctx: AppContext,
    query: ListJobsQuery,
) -> Result<impl Reply, Rejection> {
    let (page, limit, filter, fresh) = parse_list_query(query).map_err(ApiError::reject)?;
    let key = filter.cache_key(page, limit);

    if !fresh {
        if let Some(mut data) = ctx.cache.get(&key).await {
            overlay_live_fields(&ctx.repository, &mut data).await;
            return Ok(reply(StatusCode::OK, ok_body(json!({ "data": data }))));
        }
    }

    let (jobs, total) = with_deadline(async {
        ctx.repository
            .find_all(page, limit, &filter)
            .await
            .map_err(ApiError::from)
    })
    .await?;

    let data = json!({
        "jobs": jobs,
        "pagination": PaginationMeta::new(page, limit, total),
    });
    ctx.cache.set(&key, data.clone(), Some(LIST_TTL)).await;
    Ok(reply(StatusCode::OK, ok_body(json!({ "data": data }))))
}

async fn create_job_handler(ctx: AppContext, input: NewJob) -> Result<impl Reply, Rejection> {
    let job = with_deadline(async { ctx.repository.create(input).await.map_err(ApiError::from) })
        .await?;

    if job.is_active {
        ctx.scheduler.schedule_job(&job);
    }
    ctx.cache.delete_prefix("jobs:").await;

    Ok(reply(StatusCode::CREATED, ok_body(json!({ "data": job }))))
}

async fn get_job_handler(raw_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let id = parse_job_id(&raw_id)?;
    let key = format!("job:{id}");

    if let Some(mut body) = ctx.cache.get(&key).await {
        body["isScheduled"] = json!(ctx.scheduler.is_scheduled(id));
        return Ok(reply(StatusCode::OK, ok_body(body)));
    }

    let (job, executions) = with_deadline(async {
        let job = ctx
            .repository
            .find_by_id(id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))?;
        let (executions, _) = ctx
            .repository
            .find_executions(id, 1, 20)
            .await
            .map_err(ApiError::from)?;
        Ok((job, executions))
    })
    .await?;

    let data = json!({ "job": job, "executionHistory": executions });
    ctx.cache.set(&key, data.clone(), Some(DETAIL_TTL)).await;

    let mut body = data;
    body["isScheduled"] = json!(ctx.scheduler.is_scheduled(id));
    Ok(reply(StatusCode::OK, ok_body(body)))
}

async fn update_job_handler(
    raw_id: String,
    ctx: AppContext,
    patch: JobPatch,
) -> Result<impl Reply, Rejection> {
    let id = parse_job_id(&raw_id)?;
    let job = with_deadline(async {
        ctx.repository
            .update(id, patch)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))
    })
    .await?;

    if job.is_active {
        ctx.scheduler.schedule_job(&job);
    } else {
        ctx.scheduler.unschedule_job(id);
    }
    ctx.cache.delete(&format!("job:{id}")).await;
    ctx.cache.delete_prefix("jobs:").await;

    Ok(reply(StatusCode::OK, ok_body(json!({ "data": job }))))
}

async fn delete_job_handler(raw_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let id = parse_job_id(&raw_id)?;
    let job = with_deadline(async {
        ctx.repository
            .delete(id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))
    })
    .await?;

    ctx.scheduler.unschedule_job(id);
    ctx.cache.delete(&format!("job:{id}")).await;
    ctx.cache.delete_prefix("jobs:").await;

    Ok(reply(StatusCode::OK, ok_body(json!({ "data": job }))))
}

async fn trigger_job_handler(raw_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let id = parse_job_id(&raw_id)?;
    let job = with_deadline(async {
        ctx.repository
            .find_by_id(id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))
    })
    .await?;

    // Fire-and-forget; the single-flight guard in the scheduler decides
    // whether this trigger actually starts an execution.
    ctx.scheduler.spawn_execution(job.clone());

    Ok(reply(
        StatusCode::OK,
        ok_body(json!({
            "jobId": job.id,
            "jobName": job.name,
            "triggeredAt": Utc::now(),
        })),
    ))
}

async fn list_executions_handler(
    raw_id: String,
    ctx: AppContext,
    page_query: PageQuery,
) -> Result<impl Reply, Rejection> {
    let id = parse_job_id(&raw_id)?;
    let page = page_query.page.unwrap_or(1).max(1);
    let limit = page_query.limit.unwrap_or(20).clamp(1, MAX_PAGE_LIMIT);

    let (executions, total) = with_deadline(async {
        if ctx
            .repository
            .find_by_id(id)
            .await
            .map_err(ApiError::from)?
            .is_none()
        {
            return Err(ApiError::NotFound(format!("Job not found: {id}")));
        }
        ctx.repository
            .find_executions(id, page, limit)
            .await
            .map_err(ApiError::from)
    })
    .await?;

    Ok(reply(
        StatusCode::OK,
        ok_body(json!({
            "executions": executions,
            "pagination": PaginationMeta::new(page, limit, total),
        })),
    ))
}

async fn stats_handler(ctx: AppContext) -> Result<impl Reply, Rejection> {
    let scheduler = ctx.scheduler.get_stats();
    let cache = ctx.cache.stats().await;
    let database = with_deadline(async {
        ctx.repository.database_stats().await.map_err(ApiError::from)
    })
    .await?;

    Ok(reply(
        StatusCode::OK,
        ok_body(json!({
            "scheduler": scheduler,
            "cache": cache,
            "database": database,
        })),
    ))
}

async fn validate_cron_handler(request: CronValidateRequest) -> Result<impl Reply, Rejection> {
    let Some(expression) = request.expression else {
        return Err(ApiError::Validation(vec![FieldError::new(
            "expression",
            "expression is required",
            json!(null),
        )])
        .reject());
    };

    let body = match CronExpr::parse(&expression) {
        Ok(expr) => {
            let next_runs = expr.preview(Utc::now(), 5);
            json!({
                "isValid": true,
                "expression": expression,
                "nextRuns": next_runs,
                "timezone": TIMEZONE,
            })
        }
        Err(err) => json!({
            "isValid": false,
            "expression": expression,
            "message": err.to_string(),
            "nextRuns": [],
            "timezone": TIMEZONE,
        }),
    };
    Ok(reply(StatusCode::OK, ok_body(body)))
}
