//! Service info and health endpoints.

use super::{ok_body, with_context, AppContext};
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub fn routes(
    ctx: AppContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(health_handler);

    let root = warp::path::end()
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(service_info_handler);

    health.or(root)
}

async fn health_handler(ctx: AppContext) -> Result<impl Reply, Rejection> {
    let database = ctx.store.health_check().await;
    let scheduler = ctx.scheduler.get_stats();

    if database.healthy {
        Ok(warp::reply::with_status(
            warp::reply::json(&ok_body(json!({
                "status": "healthy",
                "database": database,
                "scheduler": {
                    "isRunning": scheduler.is_running,
                    "activeJobs": scheduler.active_jobs,
                    "runningExecutions": scheduler.running_executions,
                },
                "version": env!("CARGO_PKG_VERSION"),
            }))),
            StatusCode::OK,
        ))
    } else {
        Ok(warp::reply::with_status(
            warp::reply::json(&json!({
                "success": false,
                "status": "unhealthy",
                "database": database,
                "timestamp": chrono::Utc::now(),
            })),
            StatusCode::SERVICE_UNAVAILABLE,
        ))
    }
}

async fn service_info_handler(ctx: AppContext) -> Result<impl Reply, Rejection> {
    let database = ctx.store.health_check().await;
    if !database.healthy {
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({
                "success": false,
                "error": "Service Unavailable",
                "timestamp": chrono::Utc::now(),
            })),
            StatusCode::SERVICE_UNAVAILABLE,
        ));
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&ok_body(json!({
            "name": "cronwork",
            "description": "persistent cron job scheduler",
            "version": env!("CARGO_PKG_VERSION"),
            "environment": ctx.config.environment,
            "timezone": cronwork::cron::TIMEZONE,
            "endpoints": {
                "jobs": "GET,POST /jobs",
                "job": "GET,PUT,DELETE /jobs/:id",
                "trigger": "POST /jobs/:id/trigger",
                "executions": "GET /jobs/:id/executions",
                "stats": "GET /jobs/stats",
                "validateCron": "POST /jobs/validate-cron",
                "health": "GET /health",
            },
        }))),
        StatusCode::OK,
    ))
}
