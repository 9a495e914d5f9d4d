//! Shared API plumbing: response envelopes, pagination, error mapping, and
//! the per-request deadline.

pub mod jobs;
pub mod system;

use cronwork::{CronworkError, FieldError, JobRepository, ResponseCache, Scheduler, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Server-side deadline for store-touching request work; expiry yields 408.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Shared handler state, assembled once by the composition root.
#[derive(Clone)]
pub struct AppContext {
    pub repository: Arc<dyn JobRepository>,
    pub scheduler: Scheduler,
    pub cache: Arc<ResponseCache>,
    pub store: Store,
    pub config: Arc<crate::ServerConfig>,
}

pub fn with_context(
    ctx: AppContext,
) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Stamp `success: true` and `timestamp` onto a response document.
pub fn ok_body(mut body: Value) -> Value {
    if let Some(map) = body.as_object_mut() {
        map.insert("success".to_string(), json!(true));
        map.insert("timestamp".to_string(), json!(chrono::Utc::now()));
    }
    body
}

/// Pagination envelope attached to every list response.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            ((total as f64) / (limit as f64)).ceil() as u32
        };
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1 && total_pages > 0,
        }
    }
}

/// Typed request failures; mapped onto HTTP statuses by [`handle_rejection`].
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    NotFound(String),
    Deadline,
    Unavailable(String),
    Internal(String),
}

impl warp::reject::Reject for ApiError {}

impl From<CronworkError> for ApiError {
    fn from(err: CronworkError) -> Self {
        match err {
            CronworkError::Validation { details } => ApiError::Validation(details),
            CronworkError::JobNotFound { id } => ApiError::NotFound(format!("Job not found: {id}")),
            CronworkError::Database(err) => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn invalid_id(raw: &str) -> Self {
        ApiError::Validation(vec![FieldError::new(
            "id",
            "id must be a valid UUID",
            json!(raw),
        )])
    }

    pub fn reject(self) -> Rejection {
        warp::reject::custom(self)
    }
}

/// Run handler work under the request deadline.
pub async fn with_deadline<T, F>(work: F) -> Result<T, Rejection>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(REQUEST_DEADLINE, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.reject()),
        Err(_) => Err(ApiError::Deadline.reject()),
    }
}

/// Parse a UUID path parameter, rejecting with a 400 field error.
pub fn parse_job_id(raw: &str) -> Result<uuid::Uuid, Rejection> {
    raw.parse::<uuid::Uuid>()
        .map_err(|_| ApiError::invalid_id(raw).reject())
}

fn error_body(error: &str, message: Option<String>, details: Option<&[FieldError]>) -> Value {
    let mut body = json!({
        "success": false,
        "error": error,
        "timestamp": chrono::Utc::now(),
    });
    let map = body.as_object_mut().expect("error body is an object");
    if let Some(message) = message {
        map.insert("message".to_string(), json!(message));
    }
    if let Some(details) = details {
        map.insert("details".to_string(), json!(details));
    }
    body
}

/// Map rejections onto the JSON error contract. Error detail leaks only
/// outside production.
pub async fn handle_rejection(
    err: Rejection,
    production: bool,
) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(api_err) = err.find::<ApiError>() {
        match api_err {
            ApiError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                error_body("Validation Error", None, Some(details)),
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                error_body("Not Found", Some(message.clone()), None),
            ),
            ApiError::Deadline => (
                StatusCode::REQUEST_TIMEOUT,
                error_body(
                    "Request Timeout",
                    Some("request exceeded the 30 second deadline".to_string()),
                    None,
                ),
            ),
            ApiError::Unavailable(detail) => {
                error!(%detail, "store unavailable");
                let message = if production {
                    "service temporarily unavailable".to_string()
                } else {
                    detail.clone()
                };
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_body("Service Unavailable", Some(message), None),
                )
            }
            ApiError::Internal(detail) => {
                error!(%detail, "unhandled error");
                let message = if production {
                    "an unexpected error occurred".to_string()
                } else {
                    detail.clone()
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("Internal Server Error", Some(message), None),
                )
            }
        }
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            error_body("Not Found", Some("no such route".to_string()), None),
        )
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (
            StatusCode::BAD_REQUEST,
            error_body("Validation Error", Some("invalid request body".to_string()), None),
        )
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (
            StatusCode::BAD_REQUEST,
            error_body(
                "Validation Error",
                Some("invalid query parameters".to_string()),
                None,
            ),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            error_body("Method Not Allowed", None, None),
        )
    } else {
        error!(?err, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Internal Server Error", None, None),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Query parameters accepted by paginated endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_meta_math() {
        let meta = PaginationMeta::new(2, 10, 45);
        assert_eq!(meta.total_pages, 5);
        assert!(meta.has_next);
        assert!(meta.has_prev);

        let first = PaginationMeta::new(1, 50, 20);
        assert_eq!(first.total_pages, 1);
        assert!(!first.has_next);
        assert!(!first.has_prev);

        let empty = PaginationMeta::new(1, 50, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);
    }

    #[test]
    fn pagination_meta_serializes_camel_case() {
        let value = serde_json::to_value(PaginationMeta::new(1, 50, 0)).unwrap();
        assert!(value.get("totalPages").is_some());
        assert!(value.get("hasNext").is_some());
        assert!(value.get("hasPrev").is_some());
    }

    #[test]
    fn ok_body_stamps_envelope() {
        let body = ok_body(json!({"jobId": "abc"}));
        assert_eq!(body["success"], json!(true));
        assert!(body.get("timestamp").is_some());
        assert_eq!(body["jobId"], json!("abc"));
    }

    #[test]
    fn error_body_shape() {
        let details = vec![FieldError::new("name", "name must not be empty", json!(""))];
        let body = error_body("Validation Error", None, Some(&details));
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Validation Error"));
        assert_eq!(body["details"][0]["field"], json!("name"));
        assert!(body.get("timestamp").is_some());
    }
}
