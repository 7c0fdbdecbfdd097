use serde::{Deserialize, Serialize};

use perfil_core::queue::{BatchEnqueueResult, EnqueueOutcome, QueueMetrics};

// ---------------------------------------------------------------------------
// Search stage
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SerperRequest {
    /// 8-digit company key.
    pub key: String,
    pub company_name: String,
    pub trade_name: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SerperResponse {
    pub ok: bool,
    pub search_id: i64,
    pub result_count: usize,
    pub query_used: String,
}

// ---------------------------------------------------------------------------
// Async stages (discovery, profile)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StageRequest {
    pub key: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AcceptedResponse {
    /// False when an active entry for the key already existed.
    pub enqueued: bool,
}

// ---------------------------------------------------------------------------
// Scrape stage
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ScrapeRequest {
    pub key: String,
    /// Explicit site URL; falls back to the discovery row when omitted.
    pub url: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ScrapeResponse {
    pub ok: bool,
    pub chunks_saved: usize,
    pub tokens: u64,
    pub pages: usize,
    pub ms: u64,
}

// ---------------------------------------------------------------------------
// Queue surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct EnqueueRequest {
    pub key: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EnqueueResponse {
    /// "enqueued" or "already_active".
    pub outcome: &'static str,
    pub entry_id: Option<i64>,
}

impl From<EnqueueOutcome> for EnqueueResponse {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Enqueued(id) => Self {
                outcome: "enqueued",
                entry_id: Some(id),
            },
            EnqueueOutcome::AlreadyActive => Self {
                outcome: "already_active",
                entry_id: None,
            },
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct EnqueueBatchRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EnqueueBatchResponse {
    pub enqueued: Vec<String>,
    pub skipped: Vec<String>,
}

impl From<BatchEnqueueResult> for EnqueueBatchResponse {
    fn from(result: BatchEnqueueResult) -> Self {
        Self {
            enqueued: result.enqueued.into_iter().map(Into::into).collect(),
            skipped: result.skipped.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct QueueMetricsResponse {
    pub queued: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub oldest_queued_age_seconds: Option<f64>,
}

impl From<QueueMetrics> for QueueMetricsResponse {
    fn from(metrics: QueueMetrics) -> Self {
        Self {
            queued: metrics.queued,
            processing: metrics.processing,
            done: metrics.done,
            failed: metrics.failed,
            oldest_queued_age_seconds: metrics.oldest_queued_age_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Health & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
