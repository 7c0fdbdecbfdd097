use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use perfil_core::error::AppError;
use perfil_core::key::CompanyKey;
use perfil_core::models::NewSearchResult;
use perfil_core::queue::WorkQueue;
use perfil_core::search::{SearchProvider, build_search_query};
use perfil_core::stores::{ChunkStore, DiscoveryStore, SearchStore};
use perfil_db::QueueRepository;

use crate::auth::require_api_key;
use crate::dto::{
    AcceptedResponse, EnqueueBatchRequest, EnqueueBatchResponse, EnqueueRequest, EnqueueResponse,
    HealthResponse, QueueMetricsResponse, ScrapeRequest, ScrapeResponse, SerperRequest,
    SerperResponse, StageRequest,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const SEARCH_RESULT_COUNT: usize = 10;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v2/serper", post(run_search))
        .route("/v2/encontrar_site", post(enqueue_discovery_stage))
        .route("/v2/scrape", post(run_scrape))
        .route("/v2/montagem_perfil", post(enqueue_profile_stage))
        .route("/v2/queue_discovery/enqueue", post(enqueue_discovery))
        .route("/v2/queue_discovery/enqueue_batch", post(enqueue_discovery_batch))
        .route("/v2/queue_discovery/metrics", get(discovery_metrics))
        .route("/v2/queue_profile/enqueue", post(enqueue_profile))
        .route("/v2/queue_profile/enqueue_batch", post(enqueue_profile_batch))
        .route("/v2/queue_profile/metrics", get(profile_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/healthz", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

fn parse_key(raw: &str) -> Result<CompanyKey, ApiError> {
    CompanyKey::new(raw).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Synchronous stages
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v2/serper",
    request_body = SerperRequest,
    responses(
        (status = 200, description = "Search executed and stored", body = SerperResponse),
        (status = 401, description = "Unauthorized"),
        (status = 503, description = "Search vendor unreachable"),
    ),
    security(("api_key" = [])),
    tag = "stages"
)]
pub async fn run_search(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SerperRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&body.key)?;
    let query = build_search_query(
        &body.company_name,
        body.trade_name.as_deref(),
        body.city.as_deref(),
    );

    let hits = state.search.search(&query, SEARCH_RESULT_COUNT).await?;
    let result_count = hits.len();

    let search_id = state
        .db
        .stage_repo()
        .save_search(&NewSearchResult {
            key: key.clone(),
            query: query.clone(),
            hits,
        })
        .await?;

    tracing::info!(%key, search_id, result_count, %query, "search stored");

    Ok(axum::Json(SerperResponse {
        ok: true,
        search_id,
        result_count,
        query_used: query,
    }))
}

#[utoipa::path(
    post,
    path = "/v2/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Site scraped and chunked", body = ScrapeResponse),
        (status = 404, description = "No URL known for the key"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("api_key" = [])),
    tag = "stages"
)]
pub async fn run_scrape(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<ScrapeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&body.key)?;

    let url = match body.url.filter(|u| !u.trim().is_empty()) {
        Some(url) => url,
        None => state
            .db
            .stage_repo()
            .get_discovery(&key)
            .await?
            .and_then(|d| d.site_url)
            .ok_or_else(|| {
                AppError::UnavailableInput(format!("no url provided or discovered for {key}"))
            })?,
    };

    let summary = state.scraper.scrape(&key, &url).await?;

    Ok(axum::Json(ScrapeResponse {
        ok: true,
        chunks_saved: summary.chunks_saved,
        tokens: summary.total_tokens,
        pages: summary.pages_scraped,
        ms: summary.elapsed_ms,
    }))
}

// ---------------------------------------------------------------------------
// Asynchronous stages: validate input row, enqueue, 202
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v2/encontrar_site",
    request_body = StageRequest,
    responses(
        (status = 202, description = "Discovery enqueued", body = AcceptedResponse),
        (status = 404, description = "No search row for the key"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("api_key" = [])),
    tag = "stages"
)]
pub async fn enqueue_discovery_stage(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<StageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&body.key)?;

    if state.db.stage_repo().latest_search(&key).await?.is_none() {
        return Err(AppError::UnavailableInput(format!("no search row for {key}")).into());
    }

    let outcome = state.discovery_queue.enqueue(&key).await?;
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(AcceptedResponse {
            enqueued: outcome.is_enqueued(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/v2/montagem_perfil",
    request_body = StageRequest,
    responses(
        (status = 202, description = "Profile build enqueued", body = AcceptedResponse),
        (status = 404, description = "No chunks for the key"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("api_key" = [])),
    tag = "stages"
)]
pub async fn enqueue_profile_stage(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<StageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&body.key)?;

    if state.db.stage_repo().get_chunks(&key).await?.is_empty() {
        return Err(AppError::UnavailableInput(format!("no chunks for {key}")).into());
    }

    let outcome = state.profile_queue.enqueue(&key).await?;
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(AcceptedResponse {
            enqueued: outcome.is_enqueued(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Queue surface
// ---------------------------------------------------------------------------

async fn enqueue_on(
    queue: &QueueRepository,
    raw_key: &str,
) -> Result<axum::Json<EnqueueResponse>, ApiError> {
    let key = parse_key(raw_key)?;
    let outcome = queue.enqueue(&key).await?;
    Ok(axum::Json(outcome.into()))
}

async fn enqueue_batch_on(
    queue: &QueueRepository,
    raw_keys: &[String],
) -> Result<axum::Json<EnqueueBatchResponse>, ApiError> {
    let keys = raw_keys
        .iter()
        .map(|raw| CompanyKey::new(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let result = queue.enqueue_batch(&keys).await?;
    Ok(axum::Json(result.into()))
}

#[utoipa::path(
    post,
    path = "/v2/queue_discovery/enqueue",
    request_body = EnqueueRequest,
    responses((status = 200, body = EnqueueResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn enqueue_discovery(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_on(&state.discovery_queue, &body.key).await
}

#[utoipa::path(
    post,
    path = "/v2/queue_discovery/enqueue_batch",
    request_body = EnqueueBatchRequest,
    responses((status = 200, body = EnqueueBatchResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn enqueue_discovery_batch(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_batch_on(&state.discovery_queue, &body.keys).await
}

#[utoipa::path(
    get,
    path = "/v2/queue_discovery/metrics",
    responses((status = 200, body = QueueMetricsResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn discovery_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state.discovery_queue.metrics().await?;
    Ok(axum::Json(QueueMetricsResponse::from(metrics)))
}

#[utoipa::path(
    post,
    path = "/v2/queue_profile/enqueue",
    request_body = EnqueueRequest,
    responses((status = 200, body = EnqueueResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn enqueue_profile(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_on(&state.profile_queue, &body.key).await
}

#[utoipa::path(
    post,
    path = "/v2/queue_profile/enqueue_batch",
    request_body = EnqueueBatchRequest,
    responses((status = 200, body = EnqueueBatchResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn enqueue_profile_batch(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_batch_on(&state.profile_queue, &body.keys).await
}

#[utoipa::path(
    get,
    path = "/v2/queue_profile/metrics",
    responses((status = 200, body = QueueMetricsResponse), (status = 401, description = "Unauthorized")),
    security(("api_key" = [])),
    tag = "queues"
)]
pub async fn profile_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state.profile_queue.metrics().await?;
    Ok(axum::Json(QueueMetricsResponse::from(metrics)))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is up", body = HealthResponse)),
    tag = "system"
)]
pub async fn health() -> impl IntoResponse {
    // Liveness only; deliberately touches nothing downstream.
    axum::Json(HealthResponse { ok: true })
}
