//! The synchronous scrape stage: probe → breaker-guarded strategy cascade
//! on the main page → link selection → subpage fetches → aggregate →
//! dedup/chunk → replace stored chunks → update site knowledge.
//!
//! Pages that fail or hit protection are skipped; the stage succeeds when
//! at least one page yielded content. Protection on the main page after
//! every strategy is a stage failure.

use std::time::Instant;

use crate::breaker::{Admission, BreakerRegistry};
use crate::chunker::{self, ChunkerConfig, PAGE_END_MARKER, PAGE_START_MARKER};
use crate::error::AppError;
use crate::fetch::{FetchStrategy, FetchedPage, PageFetcher};
use crate::key::CompanyKey;
use crate::links::{self, LinkRanker, RankedLink};
use crate::models::SiteKnowledge;
use crate::probe::{SiteProber, origin_of, subpage_strategies};
use crate::stores::{ChunkStore, Cleaner, KnowledgeStore};

/// What the facade reports back for a scrape request.
#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub chunks_saved: usize,
    pub total_tokens: u64,
    pub pages_scraped: usize,
    pub elapsed_ms: u64,
}

/// Scrape tuning.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub link_budget: usize,
    /// Concurrent subpage fetches per stage invocation.
    pub subpage_concurrency: usize,
    pub chunker: ChunkerConfig,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            link_budget: links::DEFAULT_LINK_BUDGET,
            subpage_concurrency: 6,
            chunker: ChunkerConfig::default(),
        }
    }
}

/// Orchestrates the scrape pipeline. Generic over all I/O seams so tests
/// run without network or database.
pub struct ScrapeService<P, F, C, R, CS, KS>
where
    P: SiteProber,
    F: PageFetcher,
    C: Cleaner,
    R: LinkRanker,
    CS: ChunkStore,
    KS: KnowledgeStore,
{
    prober: P,
    fetcher: F,
    cleaner: C,
    ranker: R,
    chunk_store: CS,
    knowledge_store: KS,
    breakers: BreakerRegistry,
    config: ScrapeConfig,
}

impl<P, F, C, R, CS, KS> ScrapeService<P, F, C, R, CS, KS>
where
    P: SiteProber + 'static,
    F: PageFetcher + 'static,
    C: Cleaner + 'static,
    R: LinkRanker + 'static,
    CS: ChunkStore + 'static,
    KS: KnowledgeStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prober: P,
        fetcher: F,
        cleaner: C,
        ranker: R,
        chunk_store: CS,
        knowledge_store: KS,
        breakers: BreakerRegistry,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            prober,
            fetcher,
            cleaner,
            ranker,
            chunk_store,
            knowledge_store,
            breakers,
            config,
        }
    }

    /// Run the whole stage for one company.
    pub async fn scrape(&self, key: &CompanyKey, url: &str) -> Result<ScrapeSummary, AppError> {
        let started = Instant::now();

        let normalized = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };
        let origin = origin_of(&normalized)
            .ok_or_else(|| AppError::Generic(format!("unparseable url: {url}")))?;
        let known = self.knowledge_store.get_knowledge(&origin).await?;

        // Probe picks the reachable variant and orders the strategies.
        let site = self.prober.probe(url, known.as_ref()).await?;
        let origin = origin_of(&site.url).unwrap_or(origin);

        // The probe may have resolved to a different variant (www vs
        // apex); knowledge follows the resolved origin.
        let mut knowledge = match known.filter(|k| k.origin == origin) {
            Some(k) => k,
            None => self
                .knowledge_store
                .get_knowledge(&origin)
                .await?
                .unwrap_or_else(|| SiteKnowledge::new(origin.clone())),
        };

        tracing::info!(
            %key,
            url = %site.url,
            site_type = %site.site_type,
            protection = ?site.protection,
            "probe complete"
        );

        // Main page under the strategy cascade.
        let main = match self.fetch_cascade(&site.url, &site.strategies).await {
            Ok(page) => page,
            Err(e) => {
                knowledge.record_failure(match &e {
                    AppError::ProtectionDetected(kind) => Some(*kind),
                    _ => None,
                });
                self.knowledge_store.upsert_knowledge(&knowledge).await?;
                return Err(e);
            }
        };
        let winning = main.strategy_used;
        knowledge.record_success(winning);

        let main_text = self.cleaner.clean(&main.body)?;
        let hrefs = self.cleaner.extract_links(&main.body);
        let selected = self.select_links(&site.url, &hrefs).await;

        tracing::info!(
            %key,
            strategy = %winning,
            links = selected.len(),
            "main page fetched, following links"
        );

        // Subpages, bounded concurrency; failures skip the page.
        let subpages = self.fetch_subpages(&selected, winning).await;

        let mut pages: Vec<(String, String)> = vec![(site.url.clone(), main_text)];
        for page in subpages {
            match self.cleaner.clean(&page.body) {
                Ok(text) if !text.trim().is_empty() => pages.push((page.url, text)),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(url = %page.url, error = %e, "subpage cleaning failed");
                }
            }
        }

        let aggregated = aggregate_pages(&pages);
        if aggregated.trim().len() < 100 {
            self.knowledge_store.upsert_knowledge(&knowledge).await?;
            return Err(AppError::Generic(format!(
                "insufficient content aggregated for {key}"
            )));
        }

        let chunks = chunker::process_content(key, &aggregated, &self.config.chunker)?;
        let total_tokens: u64 = chunks.iter().map(|c| u64::from(c.tokens)).sum();
        let saved = self.chunk_store.replace_chunks(key, &chunks).await?;

        self.knowledge_store.upsert_knowledge(&knowledge).await?;

        let summary = ScrapeSummary {
            chunks_saved: saved,
            total_tokens,
            pages_scraped: pages.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            %key,
            chunks = summary.chunks_saved,
            tokens = summary.total_tokens,
            pages = summary.pages_scraped,
            ms = summary.elapsed_ms,
            "scrape complete"
        );
        Ok(summary)
    }

    /// Try strategies in order against one URL, reporting each outcome to
    /// the origin's breaker. Returns the first success or the last error.
    async fn fetch_cascade(
        &self,
        url: &str,
        strategies: &[FetchStrategy],
    ) -> Result<FetchedPage, AppError> {
        let origin = origin_of(url).unwrap_or_else(|| url.to_string());
        let breaker = self.breakers.for_origin(&origin);
        let mut last_error = AppError::Generic(format!("no strategy attempted for {url}"));

        for strategy in strategies {
            match breaker.admit() {
                Admission::Allowed => {}
                Admission::Rejected { retry_after } => {
                    return Err(AppError::RateLimited(format!(
                        "origin {origin} suspended, retry in {}s",
                        retry_after.as_secs()
                    )));
                }
            }

            match self.fetcher.fetch(url, *strategy).await {
                Ok(page) => {
                    breaker.record(Ok(()));
                    return Ok(page);
                }
                Err(e) => {
                    breaker.record(Err(&e));
                    tracing::debug!(url, strategy = %strategy, error = %e, "strategy failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Heuristic ranking, with a model re-rank only when the pool
    /// overflows the budget.
    async fn select_links(&self, base_url: &str, hrefs: &[String]) -> Vec<String> {
        let candidates: Vec<RankedLink> = links::rank_links(base_url, hrefs);
        let ranking = if candidates.len() > self.config.link_budget {
            self.ranker.rank(&candidates).await
        } else {
            None
        };
        links::apply_ranking(&candidates, ranking, self.config.link_budget)
    }

    async fn fetch_subpages(
        &self,
        urls: &[String],
        main_strategy: FetchStrategy,
    ) -> Vec<FetchedPage> {
        let strategies = subpage_strategies(main_strategy);
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(
            self.config.subpage_concurrency.max(1),
        ));
        let mut join_set = tokio::task::JoinSet::new();

        for url in urls {
            let url = url.clone();
            let strategies = strategies.clone();
            let semaphore = semaphore.clone();
            let fetcher = self.fetcher.clone();
            let breakers = self.breakers.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let origin = origin_of(&url)?;
                let breaker = breakers.for_origin(&origin);

                for strategy in &strategies {
                    if !breaker.admit().is_allowed() {
                        return None;
                    }
                    match fetcher.fetch(&url, *strategy).await {
                        Ok(page) => {
                            breaker.record(Ok(()));
                            return Some(page);
                        }
                        Err(e) => {
                            breaker.record(Err(&e));
                            tracing::debug!(url = %url, strategy = %strategy, error = %e, "subpage fetch failed");
                        }
                    }
                }
                None
            });
        }

        let mut pages = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(page)) = joined {
                pages.push(page);
            }
        }
        // Deterministic aggregation order regardless of completion order.
        pages.sort_by_key(|p| urls.iter().position(|u| *u == p.url).unwrap_or(usize::MAX));
        pages
    }
}

/// Wrap each page's text in start/end markers for the chunker.
fn aggregate_pages(pages: &[(String, String)]) -> String {
    let mut out = String::new();
    for (url, text) in pages {
        out.push_str(&format!(
            "{PAGE_START_MARKER} {url} ---\n{}\n{PAGE_END_MARKER}\n\n",
            text.trim_end()
        ));
    }
    out
}
