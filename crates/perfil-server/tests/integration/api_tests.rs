use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use perfil_core::key::CompanyKey;
use perfil_core::models::{NewSearchResult, ScrapedChunk, SearchHit};
use perfil_core::stores::{ChunkStore, SearchStore};

use crate::integration::common::{TEST_API_KEY, setup_test_app};

fn post(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(path)
        .header("x-api-key", TEST_API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::get(path)
        .header("x-api-key", TEST_API_KEY)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_is_public_and_db_free() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["ok"], true);
}

#[tokio::test]
async fn missing_or_wrong_api_key_is_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/v2/queue_discovery/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .oneshot(
            Request::get("/v2/queue_discovery/metrics")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn enqueue_is_idempotent_per_key() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(post(
            "/v2/queue_discovery/enqueue",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["outcome"], "enqueued");
    assert!(json["entry_id"].is_i64());

    let response = app
        .router
        .clone()
        .oneshot(post(
            "/v2/queue_discovery/enqueue",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["outcome"], "already_active");

    let response = app
        .router
        .oneshot(get("/v2/queue_discovery/metrics"))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["queued"], 1);
}

#[tokio::test]
async fn enqueue_batch_reports_both_lists() {
    let app = setup_test_app().await;

    app.router
        .clone()
        .oneshot(post(
            "/v2/queue_profile/enqueue",
            serde_json::json!({"key": "11111111"}),
        ))
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(post(
            "/v2/queue_profile/enqueue_batch",
            serde_json::json!({"keys": ["11111111", "22222222"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["skipped"], serde_json::json!(["11111111"]));
    assert_eq!(json["enqueued"], serde_json::json!(["22222222"]));
}

#[tokio::test]
async fn invalid_company_key_is_400() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post(
            "/v2/queue_discovery/enqueue",
            serde_json::json!({"key": "not-a-key"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn encontrar_site_without_search_row_is_404() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post(
            "/v2/encontrar_site",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn encontrar_site_with_search_row_is_202() {
    let app = setup_test_app().await;
    let key = CompanyKey::new("12345678").unwrap();

    app.db
        .stage_repo()
        .save_search(&NewSearchResult {
            key: key.clone(),
            query: "example são paulo site oficial".into(),
            hits: vec![SearchHit {
                title: "Example Ltda".into(),
                url: "https://www.example.com.br".into(),
                snippet: "site oficial".into(),
            }],
        })
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post(
            "/v2/encontrar_site",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["enqueued"], true);

    // Retrying while the entry is active acknowledges without duplicating.
    let response = app
        .router
        .oneshot(post(
            "/v2/encontrar_site",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["enqueued"], false);
}

#[tokio::test]
async fn montagem_perfil_without_chunks_is_404() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post(
            "/v2/montagem_perfil",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn montagem_perfil_with_chunks_is_202() {
    let app = setup_test_app().await;
    let key = CompanyKey::new("12345678").unwrap();

    let chunks = vec![ScrapedChunk::new(
        key.clone(),
        0,
        1,
        "conteúdo institucional".into(),
        8,
        vec!["https://www.example.com.br".into()],
    )];
    app.db
        .stage_repo()
        .replace_chunks(&key, &chunks)
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(post(
            "/v2/montagem_perfil",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn scrape_without_url_or_discovery_is_404() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post("/v2/scrape", serde_json::json!({"key": "12345678"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn serper_with_unreachable_vendor_is_503() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post(
            "/v2/serper",
            serde_json::json!({
                "key": "12345678",
                "company_name": "EXEMPLO COMERCIO DE CABOS LTDA",
                "trade_name": "Example Cabos",
                "city": "São Paulo"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn queue_metrics_are_per_queue() {
    let app = setup_test_app().await;

    app.router
        .clone()
        .oneshot(post(
            "/v2/queue_discovery/enqueue",
            serde_json::json!({"key": "12345678"}),
        ))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get("/v2/queue_profile/metrics"))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["queued"], 0);

    let response = app
        .router
        .oneshot(get("/v2/queue_discovery/metrics"))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["queued"], 1);
}
