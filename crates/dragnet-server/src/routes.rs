use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use dragnet_core::error::AppError;
use dragnet_core::rate_limit::RateLimitPolicy;
use dragnet_core::task::{Enqueued, NewTask, TaskId, TaskState};

use crate::auth::require_admin_token;
use crate::dto::{
    CountsResponse, EnqueueTaskRequest, EnqueueTaskResponse, ErrorResponse, HealthResponse,
    ListTasksQuery, RateLimitBody, ReclaimResponse, ReclaimedTaskResponse, ReviveResponse,
    TaskListResponse, TaskResponse, WorkerListResponse, WorkerResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 500;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/counts", get(get_counts))
        .route("/v1/workers", get(list_workers))
        .route("/v1/tasks", get(list_tasks).post(enqueue_task))
        .route("/v1/tasks/{id}", get(get_task))
        .route("/v1/tasks/{id}/revive", post(revive_task))
        .route("/v1/reclaim", post(reclaim))
        .route("/v1/rate-limit", get(get_rate_limit).put(set_rate_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message,
    };
    (status, axum::Json(body)).into_response()
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    Ok(TaskId::new(raw)?)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = EnqueueTaskRequest,
    responses(
        (status = 202, description = "Task queued", body = EnqueueTaskResponse),
        (status = 200, description = "Task already known, nothing changed", body = EnqueueTaskResponse),
        (status = 400, description = "Invalid id or payload", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = NewTask::new(&body.id, body.payload)?;
    let task = match body.max_attempts {
        Some(max) => task.with_max_attempts(max),
        None => task,
    };
    let id = task.id.to_string();

    let outcome = state.tasks.submit(task).await?;
    let (status, label) = match outcome {
        Enqueued::Created => (StatusCode::ACCEPTED, "created"),
        Enqueued::Revived => (StatusCode::ACCEPTED, "revived"),
        Enqueued::Duplicate => (StatusCode::OK, "duplicate"),
    };

    let response = EnqueueTaskResponse {
        id,
        outcome: label.to_string(),
    };
    Ok((status, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "Pending tasks in queue order, others most recent first", body = TaskListResponse),
        (status = 400, description = "Unknown state", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let state_filter = query
        .state
        .map(|s| s.parse::<TaskState>().map_err(AppError::Validation))
        .transpose()?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let tasks = state.tasks.list(state_filter, limit).await?;
    let total = tasks.len();

    let response = TaskListResponse {
        tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        total,
    };

    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    params(
        ("id" = String, Path, description = "Task id")
    ),
    responses(
        (status = 200, description = "Task details", body = TaskResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&id)?;

    match state.tasks.get(&task_id).await? {
        Some(task) => Ok(axum::Json(TaskResponse::from(task)).into_response()),
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Task not found: {task_id}"),
        )),
    }
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/revive",
    params(
        ("id" = String, Path, description = "Task id")
    ),
    responses(
        (status = 200, description = "Task back in the queue", body = ReviveResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Task is not failed or dead", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn revive_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&id)?;

    let Some(task) = state.tasks.get(&task_id).await? else {
        return Ok(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Task not found: {task_id}"),
        ));
    };

    if !state.tasks.revive(&task_id).await? {
        return Ok(error_response(
            StatusCode::CONFLICT,
            "conflict",
            format!("Task {task_id} is {}; only failed or dead tasks can be revived", task.state),
        ));
    }

    let response = ReviveResponse {
        id: task_id.to_string(),
        state: TaskState::Pending.to_string(),
    };
    Ok(axum::Json(response).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/reclaim",
    responses(
        (status = 200, description = "Tasks whose lease expired", body = ReclaimResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn reclaim(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let reclaimed = state.tasks.sweep().await?;
    let total = reclaimed.len();

    let response = ReclaimResponse {
        reclaimed: reclaimed
            .into_iter()
            .map(ReclaimedTaskResponse::from)
            .collect(),
        total,
    };
    Ok(axum::Json(response))
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/counts",
    responses(
        (status = 200, description = "Tasks per state", body = CountsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "monitoring"
)]
pub async fn get_counts(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let counts = state.tasks.counts().await?;
    Ok(axum::Json(CountsResponse::from(counts)))
}

#[utoipa::path(
    get,
    path = "/v1/workers",
    responses(
        (status = 200, description = "Known workers and their liveness", body = WorkerListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "monitoring"
)]
pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let workers = state.monitor.workers().await?;
    let stalled = workers.iter().filter(|w| w.stalled).count();

    let response = WorkerListResponse {
        workers: workers.into_iter().map(WorkerResponse::from).collect(),
        stalled,
    };
    Ok(axum::Json(response))
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/rate-limit",
    responses(
        (status = 200, description = "Policy in force", body = RateLimitBody),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "rate-limit"
)]
pub async fn get_rate_limit(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(RateLimitBody::from(state.limiter.policy().await))
}

#[utoipa::path(
    put,
    path = "/v1/rate-limit",
    request_body = RateLimitBody,
    responses(
        (status = 200, description = "Policy saved", body = RateLimitBody),
        (status = 400, description = "Degenerate policy", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "rate-limit"
)]
pub async fn set_rate_limit(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<RateLimitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = RateLimitPolicy::new(body.limit, Duration::from_secs(body.window_secs))
        .map_err(|e| AppError::Validation(e.to_string()))?;
    state.limiter.set_policy(policy).await?;
    Ok(axum::Json(RateLimitBody::from(policy)))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.db.health_check().await.is_ok();

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        database: if healthy { "ok" } else { "error" },
    };

    (status, axum::Json(response))
}
