//! Persistence seams. Each stage writes its own rows and reads the
//! previous stage's by company key; implementations live in the db crate.

use std::future::Future;

use crate::error::AppError;
use crate::extractor::StageStatus;
use crate::key::CompanyKey;
use crate::models::{
    DiscoveryResult, NewSearchResult, ScrapedChunk, SearchResult, SiteKnowledge,
};
use crate::profile::CompanyProfile;

/// Search rows: one per execution, immutable once written.
pub trait SearchStore: Send + Sync + Clone {
    fn save_search(
        &self,
        result: &NewSearchResult,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    fn latest_search(
        &self,
        key: &CompanyKey,
    ) -> impl Future<Output = Result<Option<SearchResult>, AppError>> + Send;
}

/// Discovery rows: one per key, upserted.
pub trait DiscoveryStore: Send + Sync + Clone {
    fn upsert_discovery(
        &self,
        result: &DiscoveryResult,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_discovery(
        &self,
        key: &CompanyKey,
    ) -> impl Future<Output = Result<Option<DiscoveryResult>, AppError>> + Send;
}

/// Chunk rows: N per key, totally replaced on re-scrape.
pub trait ChunkStore: Send + Sync + Clone {
    fn replace_chunks(
        &self,
        key: &CompanyKey,
        chunks: &[ScrapedChunk],
    ) -> impl Future<Output = Result<usize, AppError>> + Send;

    fn get_chunks(
        &self,
        key: &CompanyKey,
    ) -> impl Future<Output = Result<Vec<ScrapedChunk>, AppError>> + Send;
}

/// Profile rows: one per key, upserted with the stage outcome.
pub trait ProfileStore: Send + Sync + Clone {
    fn upsert_profile(
        &self,
        key: &CompanyKey,
        profile: &CompanyProfile,
        status: StageStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Advisory per-origin fetch knowledge.
pub trait KnowledgeStore: Send + Sync + Clone {
    fn get_knowledge(
        &self,
        origin: &str,
    ) -> impl Future<Output = Result<Option<SiteKnowledge>, AppError>> + Send;

    fn upsert_knowledge(
        &self,
        knowledge: &SiteKnowledge,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Converts raw HTML into clean text and harvests in-page links.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;

    /// Raw href values found in the document, unresolved.
    fn extract_links(&self, html: &str) -> Vec<String>;
}
