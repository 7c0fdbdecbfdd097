use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use perfil_client::{
    HtmdCleaner, OpenAiCompatVendor, ProxyPool, ReqwestFetcher, ReqwestProber, SerperClient,
};
use perfil_core::breaker::BreakerRegistry;
use perfil_core::links::LlmLinkRanker;
use perfil_core::llm::{CallerConfig, StructuredCaller, VendorCapabilities, VendorConfig};
use perfil_core::rate_gate::RateGate;
use perfil_core::scrape::{ScrapeConfig, ScrapeService};
use perfil_db::{Database, QueueName};
use perfil_server::routes;
use perfil_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

/// Test app handle; keeps the Postgres container alive.
pub struct TestApp {
    pub router: Router,
    pub db: Database,
    _container: ContainerAsync<GenericImage>,
}

/// Spin up Postgres, run migrations, and wire the facade with vendor
/// endpoints that point nowhere (only the DB-backed surface is exercised
/// here; unreachable vendors double as the failure-path fixture).
pub async fn setup_test_app() -> TestApp {
    let container = start_postgres().await;
    let pool = connect_to_container(&container).await;
    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");

    let gate = RateGate::new();
    let caller = StructuredCaller::new(
        vec![(
            VendorConfig {
                name: "primary".into(),
                model: "test-model".into(),
                max_concurrent: 2,
                max_output_tokens: 2_048,
                priority: 50,
                capabilities: VendorCapabilities {
                    schema_directive: true,
                    sampling_controls: true,
                },
            },
            OpenAiCompatVendor::new(
                "primary",
                "http://127.0.0.1:9/v1",
                "test",
                "test-model",
                Duration::from_secs(2),
            )
            .expect("vendor builds"),
        )],
        gate.clone(),
        CallerConfig::default(),
    );

    let scraper = ScrapeService::new(
        ReqwestProber::new(Duration::from_secs(1)).expect("prober builds"),
        ReqwestFetcher::new(ProxyPool::new(vec![])),
        HtmdCleaner::new(),
        LlmLinkRanker::new(caller),
        db.stage_repo(),
        db.knowledge_repo(),
        BreakerRegistry::default(),
        ScrapeConfig::default(),
    );

    let search = SerperClient::with_endpoint("test-key", "http://127.0.0.1:9/search", gate)
        .expect("search client builds");

    let state = Arc::new(AppState {
        search,
        scraper,
        discovery_queue: db.queue(QueueName::Discovery),
        profile_queue: db.queue(QueueName::Profile),
        api_token: Some(TEST_API_KEY.to_string()),
        db: db.clone(),
    });

    TestApp {
        router: routes::router(state),
        db,
        _container: container,
    }
}

async fn start_postgres() -> ContainerAsync<GenericImage> {
    GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "perfil_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container")
}

async fn connect_to_container(container: &ContainerAsync<GenericImage>) -> PgPool {
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/perfil_test");
    retry_connect(&url).await
}

async fn retry_connect(url: &str) -> PgPool {
    let mut delay = Duration::from_millis(100);
    let max_delay = Duration::from_secs(2);
    let mut last_err = None;

    for _ in 0..60 {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => return pool,
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }
    }
    panic!("Failed to connect to test database at {url}: {last_err:?}");
}
