use chrono::Utc;

use perfil_core::extractor::StageStatus;
use perfil_core::key::CompanyKey;
use perfil_core::models::{
    DiscoveryResult, DiscoveryStatus, NewSearchResult, ScrapedChunk, SearchHit, SiteKnowledge,
};
use perfil_core::fetch::{FetchStrategy, ProtectionKind};
use perfil_core::profile::CompanyProfile;
use perfil_core::stores::{ChunkStore, DiscoveryStore, KnowledgeStore, ProfileStore, SearchStore};

use crate::integration::common::setup_test_db;

fn key() -> CompanyKey {
    CompanyKey::new("12345678").unwrap()
}

fn sample_hits() -> Vec<SearchHit> {
    vec![
        SearchHit {
            title: "Example Ltda — Site Oficial".into(),
            url: "https://www.example.com.br".into(),
            snippet: "Fabricante de cabos".into(),
        },
        SearchHit {
            title: "Example no guia".into(),
            url: "https://guia.com.br/example".into(),
            snippet: "".into(),
        },
    ]
}

#[tokio::test]
async fn search_rows_are_append_only_and_latest_wins() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();

    let first = repo
        .save_search(&NewSearchResult {
            key: key(),
            query: "example são paulo site oficial".into(),
            hits: vec![],
        })
        .await
        .unwrap();
    let second = repo
        .save_search(&NewSearchResult {
            key: key(),
            query: "example cabos são paulo site oficial".into(),
            hits: sample_hits(),
        })
        .await
        .unwrap();
    assert!(second > first);

    let latest = repo.latest_search(&key()).await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert_eq!(latest.hits.len(), 2);
    assert_eq!(latest.hits[0].title, "Example Ltda — Site Oficial");
}

#[tokio::test]
async fn latest_search_missing_key_is_none() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();
    assert!(repo.latest_search(&key()).await.unwrap().is_none());
}

#[tokio::test]
async fn discovery_upsert_overwrites_single_row() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();

    repo.upsert_discovery(&DiscoveryResult {
        key: key(),
        site_url: None,
        status: DiscoveryStatus::NotFound,
        confidence: 0.0,
        reasoning: None,
        updated_at: Utc::now(),
    })
    .await
    .unwrap();

    repo.upsert_discovery(&DiscoveryResult {
        key: key(),
        site_url: Some("https://www.example.com.br".into()),
        status: DiscoveryStatus::Found,
        confidence: 0.9,
        reasoning: Some("domínio próprio".into()),
        updated_at: Utc::now(),
    })
    .await
    .unwrap();

    let stored = repo.get_discovery(&key()).await.unwrap().unwrap();
    assert_eq!(stored.status, DiscoveryStatus::Found);
    assert_eq!(stored.site_url.as_deref(), Some("https://www.example.com.br"));
    assert!((stored.confidence - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn chunks_are_replaced_wholesale() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();

    let first: Vec<ScrapedChunk> = (0..3)
        .map(|i| {
            ScrapedChunk::new(
                key(),
                i,
                3,
                format!("conteúdo {i}"),
                10,
                vec![format!("https://example.com.br/p{i}")],
            )
        })
        .collect();
    assert_eq!(repo.replace_chunks(&key(), &first).await.unwrap(), 3);

    let second = vec![ScrapedChunk::new(
        key(),
        0,
        1,
        "conteúdo novo".into(),
        5,
        vec!["https://example.com.br".into()],
    )];
    assert_eq!(repo.replace_chunks(&key(), &second).await.unwrap(), 1);

    let stored = repo.get_chunks(&key()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "conteúdo novo");
    assert_eq!(stored[0].chunk_total, 1);
    assert_eq!(stored[0].source_urls, vec!["https://example.com.br"]);
}

#[tokio::test]
async fn chunks_come_back_in_index_order() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();

    // Insert out of order.
    let chunks = vec![
        ScrapedChunk::new(key(), 2, 3, "c".into(), 1, vec![]),
        ScrapedChunk::new(key(), 0, 3, "a".into(), 1, vec![]),
        ScrapedChunk::new(key(), 1, 3, "b".into(), 1, vec![]),
    ];
    repo.replace_chunks(&key(), &chunks).await.unwrap();

    let stored = repo.get_chunks(&key()).await.unwrap();
    let contents: Vec<_> = stored.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn profile_upsert_flattens_indexed_columns() {
    let (db, _container) = setup_test_db().await;
    let repo = db.stage_repo();

    let mut profile = CompanyProfile::default();
    profile.identity.company_name = Some("Example Ltda".into());
    profile.classification.industry = Some("Eletroeletrônico".into());

    repo.upsert_profile(&key(), &profile, StageStatus::Partial)
        .await
        .unwrap();

    let (stored, status) = repo.get_profile(&key()).await.unwrap().unwrap();
    assert_eq!(status, StageStatus::Partial);
    assert_eq!(stored.identity.company_name.as_deref(), Some("Example Ltda"));

    // Upsert replaces in place.
    profile.identity.company_name = Some("Example Comercio Ltda".into());
    repo.upsert_profile(&key(), &profile, StageStatus::Success)
        .await
        .unwrap();
    let (stored, status) = repo.get_profile(&key()).await.unwrap().unwrap();
    assert_eq!(status, StageStatus::Success);
    assert_eq!(
        stored.identity.company_name.as_deref(),
        Some("Example Comercio Ltda")
    );

    let (name, industry): (Option<String>, Option<String>) = sqlx::query_as(
        "SELECT company_name, industry FROM company_profiles WHERE company_key = $1",
    )
    .bind(key().as_str())
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(name.as_deref(), Some("Example Comercio Ltda"));
    assert_eq!(industry.as_deref(), Some("Eletroeletrônico"));
}

#[tokio::test]
async fn knowledge_upsert_roundtrip() {
    let (db, _container) = setup_test_db().await;
    let repo = db.knowledge_repo();

    assert!(
        repo.get_knowledge("https://www.example.com.br")
            .await
            .unwrap()
            .is_none()
    );

    let mut knowledge = SiteKnowledge::new("https://www.example.com.br");
    knowledge.record_failure(Some(ProtectionKind::BrowserChallenge));
    knowledge.record_success(FetchStrategy::Aggressive);
    repo.upsert_knowledge(&knowledge).await.unwrap();

    let stored = repo
        .get_knowledge("https://www.example.com.br")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.best_strategy, FetchStrategy::Aggressive);
    assert_eq!(stored.protection, Some(ProtectionKind::BrowserChallenge));
    assert_eq!(stored.total_attempts, 2);
    assert_eq!(stored.total_successes, 1);
    assert!(stored.last_success_at.is_some());
}
