use utoipa::OpenApi;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

use crate::dto;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::run_search,
        routes::run_scrape,
        routes::enqueue_discovery_stage,
        routes::enqueue_profile_stage,
        routes::enqueue_discovery,
        routes::enqueue_discovery_batch,
        routes::discovery_metrics,
        routes::enqueue_profile,
        routes::enqueue_profile_batch,
        routes::profile_metrics,
        routes::health,
    ),
    components(schemas(
        dto::SerperRequest,
        dto::SerperResponse,
        dto::StageRequest,
        dto::AcceptedResponse,
        dto::ScrapeRequest,
        dto::ScrapeResponse,
        dto::EnqueueRequest,
        dto::EnqueueResponse,
        dto::EnqueueBatchRequest,
        dto::EnqueueBatchResponse,
        dto::QueueMetricsResponse,
        dto::HealthResponse,
        dto::ErrorResponse,
    )),
    modifiers(&ApiKeySecurity),
    tags(
        (name = "stages", description = "Per-stage pipeline endpoints"),
        (name = "queues", description = "Durable queue surface"),
        (name = "system", description = "Liveness"),
    ),
    info(
        title = "Company Profile Pipeline",
        description = "Staged pipeline building structured profiles of Brazilian B2B companies",
    )
)]
pub struct ApiDoc;

struct ApiKeySecurity;

impl utoipa::Modify for ApiKeySecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-api-key"))),
            );
        }
    }
}
