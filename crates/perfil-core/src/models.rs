use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fetch::{FetchStrategy, ProtectionKind};
use crate::key::CompanyKey;

/// One hit returned by the search vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// One search execution. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: i64,
    pub key: CompanyKey,
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub created_at: DateTime<Utc>,
}

/// DTO for inserting a search result.
#[derive(Debug, Clone)]
pub struct NewSearchResult {
    pub key: CompanyKey,
    pub query: String,
    pub hits: Vec<SearchHit>,
}

/// Outcome of the site-discovery stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Found,
    NotFound,
    Error,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Found => "found",
            DiscoveryStatus::NotFound => "not_found",
            DiscoveryStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "found" => Some(DiscoveryStatus::Found),
            "not_found" => Some(DiscoveryStatus::NotFound),
            "error" => Some(DiscoveryStatus::Error),
            _ => None,
        }
    }
}

/// One row per key, upserted by the discovery stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub key: CompanyKey,
    pub site_url: Option<String>,
    pub status: DiscoveryStatus,
    /// Model confidence, clamped to [0, 1].
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A token-bounded slice of deduplicated site text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedChunk {
    pub key: CompanyKey,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub content: String,
    pub tokens: u32,
    pub source_urls: Vec<String>,
    /// SHA-256 of `content`, for change detection across re-scrapes.
    pub content_hash: String,
}

impl ScrapedChunk {
    pub fn new(
        key: CompanyKey,
        chunk_index: u32,
        chunk_total: u32,
        content: String,
        tokens: u32,
        source_urls: Vec<String>,
    ) -> Self {
        let content_hash = compute_hash(&content);
        Self {
            key,
            chunk_index,
            chunk_total,
            content,
            tokens,
            source_urls,
            content_hash,
        }
    }
}

/// Advisory per-origin fetch knowledge, consulted by the prober and
/// updated by the scrape stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteKnowledge {
    /// scheme + host.
    pub origin: String,
    pub best_strategy: FetchStrategy,
    pub protection: Option<ProtectionKind>,
    pub total_attempts: u32,
    pub total_successes: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl SiteKnowledge {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            best_strategy: FetchStrategy::Standard,
            protection: None,
            total_attempts: 0,
            total_successes: 0,
            last_success_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        f64::from(self.total_successes) / f64::from(self.total_attempts)
    }

    pub fn record_success(&mut self, strategy: FetchStrategy) {
        self.total_attempts += 1;
        self.total_successes += 1;
        self.last_success_at = Some(Utc::now());
        // Promote the winning strategy once the origin looks stable.
        if self.success_rate() > 0.8 || self.total_successes == 1 {
            self.best_strategy = strategy;
        }
    }

    pub fn record_failure(&mut self, protection: Option<ProtectionKind>) {
        self.total_attempts += 1;
        if protection.is_some() {
            self.protection = protection;
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let h1 = compute_hash("conteúdo");
        let h2 = compute_hash("conteúdo");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_hash("outro"));
    }

    #[test]
    fn discovery_status_roundtrip() {
        for s in [
            DiscoveryStatus::Found,
            DiscoveryStatus::NotFound,
            DiscoveryStatus::Error,
        ] {
            assert_eq!(DiscoveryStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn chunk_carries_content_hash() {
        let key = CompanyKey::new("12345678").unwrap();
        let chunk = ScrapedChunk::new(key, 0, 1, "texto".into(), 2, vec![]);
        assert_eq!(chunk.content_hash, compute_hash("texto"));
    }

    #[test]
    fn knowledge_promotes_strategy_on_success() {
        let mut knowledge = SiteKnowledge::new("https://example.com.br");
        assert_eq!(knowledge.best_strategy, FetchStrategy::Standard);

        knowledge.record_success(FetchStrategy::Aggressive);
        assert_eq!(knowledge.best_strategy, FetchStrategy::Aggressive);
        assert!(knowledge.last_success_at.is_some());
        assert!((knowledge.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn knowledge_records_protection() {
        let mut knowledge = SiteKnowledge::new("https://example.com.br");
        knowledge.record_failure(Some(ProtectionKind::Waf));
        assert_eq!(knowledge.protection, Some(ProtectionKind::Waf));
        assert_eq!(knowledge.total_successes, 0);
        assert_eq!(knowledge.total_attempts, 1);
    }
}
