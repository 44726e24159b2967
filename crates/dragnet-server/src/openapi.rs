use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Dragnet API",
        version = "0.1.0",
        description = "Control plane for a distributed scraping task queue."
    ),
    paths(
        crate::routes::enqueue_task,
        crate::routes::list_tasks,
        crate::routes::get_task,
        crate::routes::revive_task,
        crate::routes::reclaim,
        crate::routes::get_counts,
        crate::routes::list_workers,
        crate::routes::get_rate_limit,
        crate::routes::set_rate_limit,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::EnqueueTaskRequest,
        crate::dto::EnqueueTaskResponse,
        crate::dto::TaskResponse,
        crate::dto::TaskListResponse,
        crate::dto::ReviveResponse,
        crate::dto::ReclaimedTaskResponse,
        crate::dto::ReclaimResponse,
        crate::dto::CountsResponse,
        crate::dto::WorkerResponse,
        crate::dto::WorkerListResponse,
        crate::dto::RateLimitBody,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "tasks", description = "Enqueue, inspect and revive tasks"),
        (name = "monitoring", description = "Queue counts and worker liveness"),
        (name = "rate-limit", description = "Shared scraping rate"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin API key. Set via DRAGNET_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
