use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use perfil_client::{
    HtmdCleaner, OpenAiCompatVendor, ProxyPool, ReqwestFetcher, ReqwestProber, SerperClient,
};
use perfil_core::breaker::BreakerRegistry;
use perfil_core::discovery::DiscoveryAgent;
use perfil_core::extractor::ProfileExtractor;
use perfil_core::links::LlmLinkRanker;
use perfil_core::llm::{
    CallerConfig, StructuredCaller, VendorCapabilities, VendorConfig,
};
use perfil_core::rate_gate::{BucketConfig, GateKey, RateGate};
use perfil_core::scrape::{ScrapeConfig, ScrapeService};
use perfil_core::stages::{DiscoveryHandler, ProfileHandler};
use perfil_core::worker::{StageWorker, TracingWorkerReporter, WorkerConfig};
use perfil_db::{Database, DatabaseConfig, QueueName};
use perfil_server::routes;
use perfil_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("perfil=info".parse()?))
        .with_target(false)
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string());
    let addr = format!("0.0.0.0:{port}");
    let api_token = std::env::var("API_ACCESS_TOKEN").ok().filter(|t| !t.is_empty());
    let n_workers: usize = env_parse("N_WORKERS", 2)?;
    let hard_cap: usize = env_parse("LLM_CONCURRENCY_HARD_CAP", 32)?;
    let search_key =
        std::env::var("SEARCH_KEY").context("SEARCH_KEY not set. Required for the search stage.")?;

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    if api_token.is_some() {
        tracing::info!("API authentication: enabled");
    } else {
        tracing::info!("API authentication: disabled (set API_ACCESS_TOKEN to enable)");
    }

    // Rate gate + vendors, shared by every model consumer.
    let gate = RateGate::new();
    gate.register(
        GateKey::new("serper", "search"),
        BucketConfig::per_minute(env_parse("SEARCH_RPM", 100.0)?, 10.0),
    );
    let vendors = build_vendors(&gate, hard_cap)?;
    let caller = StructuredCaller::new(
        vendors,
        gate.clone(),
        CallerConfig {
            global_concurrency_cap: hard_cap,
            ..Default::default()
        },
    );

    let stage_repo = db.stage_repo();
    let knowledge_repo = db.knowledge_repo();

    let scraper = ScrapeService::new(
        ReqwestProber::new(Duration::from_secs(5))?,
        ReqwestFetcher::new(ProxyPool::from_env()),
        HtmdCleaner::new(),
        LlmLinkRanker::new(caller.clone()),
        stage_repo.clone(),
        knowledge_repo.clone(),
        BreakerRegistry::default(),
        ScrapeConfig::default(),
    );

    let state = Arc::new(AppState {
        search: SerperClient::new(&search_key, gate.clone())?,
        scraper,
        discovery_queue: db.queue(QueueName::Discovery),
        profile_queue: db.queue(QueueName::Profile),
        api_token,
        db: db.clone(),
    });

    // Worker fleet: N of each stage type, sharing one cancellation token.
    let cancel = CancellationToken::new();
    let mut worker_handles = Vec::new();

    for i in 0..n_workers {
        let handler = DiscoveryHandler::new(
            DiscoveryAgent::new(caller.clone()),
            stage_repo.clone(),
            stage_repo.clone(),
        );
        let worker = StageWorker::new(
            db.queue(QueueName::Discovery),
            handler,
            WorkerConfig::default().with_worker_id(format!("discovery-{i}")),
        );
        let cancel = cancel.clone();
        worker_handles.push(tokio::spawn(async move {
            worker.run(cancel, &TracingWorkerReporter).await
        }));
    }

    for i in 0..n_workers {
        let handler = ProfileHandler::new(
            ProfileExtractor::new(caller.clone()),
            stage_repo.clone(),
            stage_repo.clone(),
        );
        let worker = StageWorker::new(
            db.queue(QueueName::Profile),
            handler,
            WorkerConfig::default().with_worker_id(format!("profile-{i}")),
        );
        let cancel = cancel.clone();
        worker_handles.push(tokio::spawn(async move {
            worker.run(cancel, &TracingWorkerReporter).await
        }));
    }

    tracing::info!(workers = n_workers * 2, "worker fleet started");

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // In-flight entries finish; no new claims happen after cancellation.
    cancel.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid {name}: '{raw}'")),
    }
}

/// Vendor chain from the environment. The primary (`LLM_URL` +
/// `MODEL_NAME`) is required; a fallback vendor is registered when
/// `FALLBACK_LLM_URL` and `FALLBACK_MODEL_NAME` are present.
fn build_vendors(
    gate: &RateGate,
    hard_cap: usize,
) -> anyhow::Result<Vec<(VendorConfig, OpenAiCompatVendor)>> {
    let mut vendors = Vec::new();

    let primary_url =
        std::env::var("LLM_URL").context("LLM_URL not set. Required for model stages.")?;
    let primary_model =
        std::env::var("MODEL_NAME").context("MODEL_NAME not set. Required for model stages.")?;
    let primary_key = std::env::var("LLM_API_KEY").unwrap_or_else(|_| "perfil".into());

    let max_concurrent: usize = env_parse("LLM_MAX_CONCURRENT", 16)?;
    let max_output: u32 = env_parse("LLM_MAX_OUTPUT_TOKENS", 8_192)?;
    let rpm: f64 = env_parse("LLM_RPM", 600.0)?;

    let mut register = |name: &str,
                        url: String,
                        api_key: String,
                        model: String,
                        priority: u32|
     -> anyhow::Result<()> {
        gate.register(
            GateKey::new(name, "requests"),
            BucketConfig::per_minute(rpm, max_concurrent as f64),
        );
        let vendor = OpenAiCompatVendor::new(name, &url, &api_key, &model, Duration::from_secs(120))?;
        vendors.push((
            VendorConfig {
                name: name.to_string(),
                model,
                max_concurrent: max_concurrent.min(hard_cap),
                max_output_tokens: max_output,
                priority,
                capabilities: VendorCapabilities {
                    schema_directive: true,
                    sampling_controls: true,
                },
            },
            vendor,
        ));
        tracing::info!(vendor = name, url = %url, "model vendor registered");
        Ok(())
    };

    register("primary", primary_url, primary_key, primary_model, 90)?;

    if let (Ok(url), Ok(model)) = (
        std::env::var("FALLBACK_LLM_URL"),
        std::env::var("FALLBACK_MODEL_NAME"),
    ) {
        let key = std::env::var("FALLBACK_LLM_API_KEY").unwrap_or_else(|_| "perfil".into());
        register("fallback", url, key, model, 50)?;
    }

    Ok(vendors)
}
