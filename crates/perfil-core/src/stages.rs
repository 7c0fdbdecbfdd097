//! The two queue-backed stage handlers: discovery and profile.
//!
//! Each reads the previous stage's row by company key, runs its model
//! work, and writes its own row. Missing input is a non-retriable
//! `unavailable_input` failure.

use chrono::Utc;

use crate::discovery::DiscoveryAgent;
use crate::error::AppError;
use crate::extractor::ProfileExtractor;
use crate::key::CompanyKey;
use crate::llm::LlmVendor;
use crate::models::{DiscoveryResult, DiscoveryStatus};
use crate::stores::{ChunkStore, DiscoveryStore, ProfileStore, SearchStore};
use crate::worker::StageHandler;

/// Wall-clock budget for one discovery invocation, retries included.
const DISCOVERY_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);

/// Discovery: SearchResult row → model decision → DiscoveryResult row.
pub struct DiscoveryHandler<V, SS, DS>
where
    V: LlmVendor,
    SS: SearchStore,
    DS: DiscoveryStore,
{
    agent: DiscoveryAgent<V>,
    search_store: SS,
    discovery_store: DS,
}

impl<V, SS, DS> DiscoveryHandler<V, SS, DS>
where
    V: LlmVendor,
    SS: SearchStore,
    DS: DiscoveryStore,
{
    pub fn new(agent: DiscoveryAgent<V>, search_store: SS, discovery_store: DS) -> Self {
        Self {
            agent,
            search_store,
            discovery_store,
        }
    }
}

impl<V, SS, DS> StageHandler for DiscoveryHandler<V, SS, DS>
where
    V: LlmVendor,
    SS: SearchStore,
    DS: DiscoveryStore,
{
    fn stage(&self) -> &'static str {
        "discovery"
    }

    async fn handle(&self, key: &CompanyKey) -> Result<(), AppError> {
        let search = self
            .search_store
            .latest_search(key)
            .await?
            .ok_or_else(|| AppError::UnavailableInput(format!("no search row for {key}")))?;

        let decision = tokio::time::timeout(DISCOVERY_DEADLINE, self.agent.discover(&search))
            .await
            .unwrap_or_else(|_| Err(AppError::Timeout(DISCOVERY_DEADLINE.as_secs())))?;

        tracing::info!(
            %key,
            status = decision.status.as_str(),
            url = decision.chosen_url.as_deref().unwrap_or("-"),
            confidence = decision.confidence,
            "discovery decided"
        );

        self.discovery_store
            .upsert_discovery(&DiscoveryResult {
                key: key.clone(),
                site_url: decision.chosen_url,
                status: decision.status,
                confidence: decision.confidence,
                reasoning: decision.reasoning,
                updated_at: Utc::now(),
            })
            .await
    }
}

/// Profile: ScrapedChunk rows → per-chunk extraction → merged profile row.
pub struct ProfileHandler<V, CS, PS>
where
    V: LlmVendor,
    CS: ChunkStore,
    PS: ProfileStore,
{
    extractor: ProfileExtractor<V>,
    chunk_store: CS,
    profile_store: PS,
}

impl<V, CS, PS> ProfileHandler<V, CS, PS>
where
    V: LlmVendor,
    CS: ChunkStore,
    PS: ProfileStore,
{
    pub fn new(extractor: ProfileExtractor<V>, chunk_store: CS, profile_store: PS) -> Self {
        Self {
            extractor,
            chunk_store,
            profile_store,
        }
    }
}

impl<V, CS, PS> StageHandler for ProfileHandler<V, CS, PS>
where
    V: LlmVendor,
    CS: ChunkStore,
    PS: ProfileStore,
{
    fn stage(&self) -> &'static str {
        "profile"
    }

    async fn handle(&self, key: &CompanyKey) -> Result<(), AppError> {
        let chunks = self.chunk_store.get_chunks(key).await?;
        if chunks.is_empty() {
            return Err(AppError::UnavailableInput(format!("no chunks for {key}")));
        }

        let outcome = self.extractor.build(&chunks).await?;

        tracing::info!(
            %key,
            status = %outcome.status,
            contributed = outcome.chunks_contributed,
            total = outcome.chunks_total,
            "profile built"
        );

        // An all-chunks-failed build is a stage failure so the queue can
        // retry it; partial results are persisted.
        if outcome.chunks_contributed == 0 {
            return Err(AppError::Exhausted(format!(
                "no chunk contributed for {key}"
            )));
        }

        self.profile_store
            .upsert_profile(key, &outcome.profile, outcome.status)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryAgent;
    use crate::extractor::{ProfileExtractor, StageStatus};
    use crate::llm::{CallerConfig, StructuredCaller, VendorCapabilities, VendorConfig};
    use crate::models::{NewSearchResult, SearchHit};
    use crate::rate_gate::RateGate;
    use crate::testutil::{
        MockChunkStore, MockDiscoveryStore, MockProfileStore, MockSearchStore, MockVendor,
    };

    fn key() -> CompanyKey {
        CompanyKey::new("12345678").unwrap()
    }

    fn caller(vendor: MockVendor) -> StructuredCaller<MockVendor> {
        let config = VendorConfig {
            name: "primary".into(),
            model: "test-model".into(),
            max_concurrent: 2,
            max_output_tokens: 4_096,
            priority: 50,
            capabilities: VendorCapabilities {
                schema_directive: true,
                sampling_controls: true,
            },
        };
        StructuredCaller::new(
            vec![(config, vendor)],
            RateGate::new(),
            CallerConfig {
                backoff_base: std::time::Duration::from_millis(1),
                backoff_cap: std::time::Duration::from_millis(2),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn discovery_handler_writes_result_row() {
        let search_store = MockSearchStore::empty();
        search_store
            .save_search(&NewSearchResult {
                key: key(),
                query: "example são paulo site oficial".into(),
                hits: vec![SearchHit {
                    title: "Example Ltda".into(),
                    url: "https://www.example.com.br".into(),
                    snippet: "Site oficial".into(),
                }],
            })
            .await
            .unwrap();

        let response = serde_json::json!({
            "chosen_url": "https://www.example.com.br",
            "status": "found",
            "confidence": 0.9
        })
        .to_string();
        let handler = DiscoveryHandler::new(
            DiscoveryAgent::new(caller(MockVendor::with_responses(vec![Ok(response)]))),
            search_store,
            MockDiscoveryStore::empty(),
        );

        handler.handle(&key()).await.unwrap();

        let stored = handler.discovery_store.get(&key()).unwrap();
        assert_eq!(stored.status, DiscoveryStatus::Found);
        assert_eq!(
            stored.site_url.as_deref(),
            Some("https://www.example.com.br")
        );
    }

    #[tokio::test]
    async fn discovery_without_search_row_is_unavailable_input() {
        let handler = DiscoveryHandler::new(
            DiscoveryAgent::new(caller(MockVendor::with_responses(vec![]))),
            MockSearchStore::empty(),
            MockDiscoveryStore::empty(),
        );

        let err = handler.handle(&key()).await.unwrap_err();
        assert!(matches!(err, AppError::UnavailableInput(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn profile_handler_merges_and_upserts() {
        let chunk_store = MockChunkStore::empty();
        let chunks = vec![
            crate::models::ScrapedChunk::new(key(), 0, 2, "a".into(), 1, vec![]),
            crate::models::ScrapedChunk::new(key(), 1, 2, "b".into(), 1, vec![]),
        ];
        chunk_store.replace_chunks(&key(), &chunks).await.unwrap();

        let profile_json = serde_json::json!({
            "identity": {"company_name": "Example Ltda"},
            "offerings": {"product_categories": [], "services": []}
        })
        .to_string();
        let handler = ProfileHandler::new(
            ProfileExtractor::new(caller(MockVendor::with_responses(vec![
                Ok(profile_json.clone()),
                Ok(profile_json),
            ]))),
            chunk_store,
            MockProfileStore::empty(),
        );

        handler.handle(&key()).await.unwrap();

        let (profile, status) = handler.profile_store.get(&key()).unwrap();
        assert_eq!(status, StageStatus::Success);
        assert_eq!(profile.identity.company_name.as_deref(), Some("Example Ltda"));
    }

    #[tokio::test]
    async fn profile_without_chunks_is_unavailable_input() {
        let handler = ProfileHandler::new(
            ProfileExtractor::new(caller(MockVendor::with_responses(vec![]))),
            MockChunkStore::empty(),
            MockProfileStore::empty(),
        );

        let err = handler.handle(&key()).await.unwrap_err();
        assert!(matches!(err, AppError::UnavailableInput(_)));
    }

    #[tokio::test]
    async fn profile_all_chunks_failed_is_stage_failure() {
        let chunk_store = MockChunkStore::empty();
        let chunks = vec![crate::models::ScrapedChunk::new(
            key(),
            0,
            1,
            "a".into(),
            1,
            vec![],
        )];
        chunk_store.replace_chunks(&key(), &chunks).await.unwrap();

        let handler = ProfileHandler::new(
            ProfileExtractor::new(caller(MockVendor::always_failing(|| {
                AppError::Transport("refused".into())
            }))),
            chunk_store,
            MockProfileStore::empty(),
        );

        let err = handler.handle(&key()).await.unwrap_err();
        assert!(matches!(err, AppError::Exhausted(_)));
        assert!(handler.profile_store.get(&key()).is_none());
    }
}
