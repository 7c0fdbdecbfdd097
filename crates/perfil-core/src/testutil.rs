//! Test utilities: handwritten in-memory implementations of the core
//! traits, with `Arc<Mutex<_>>` interior mutability so tests can assert
//! on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::error::AppError;
use crate::extractor::StageStatus;
use crate::fetch::{FetchStrategy, FetchedPage, PageFetcher, ProtectionKind};
use crate::key::CompanyKey;
use crate::llm::{CompletionRequest, CompletionResponse, LlmVendor};
use crate::models::{
    DiscoveryResult, NewSearchResult, ScrapedChunk, SearchResult, SiteKnowledge,
};
use crate::probe::{SiteProber, SiteProfile, SiteType};
use crate::profile::CompanyProfile;
use crate::queue::{
    BatchEnqueueResult, EnqueueOutcome, FailOutcome, QueueConfig, QueueEntry, QueueMetrics,
    QueueStatus, WorkQueue,
};
use crate::stores::{
    ChunkStore, Cleaner, DiscoveryStore, KnowledgeStore, ProfileStore, SearchStore,
};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockVendor
// ---------------------------------------------------------------------------

type FailureFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// Mock LLM vendor. Pops scripted responses in order and records every
/// request it receives; an exhausted script yields an error.
#[derive(Clone)]
pub struct MockVendor {
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    always_fail: Option<FailureFactory>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockVendor {
    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            always_fail: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always_failing<F>(factory: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            always_fail: Some(Arc::new(factory)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmVendor for MockVendor {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AppError> {
        self.requests.lock().unwrap().push(request);

        if let Some(factory) = &self.always_fail {
            return Err(factory());
        }

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(AppError::Generic("mock vendor script exhausted".into()));
        }
        responses.remove(0).map(|content| CompletionResponse {
            content,
            latency: Duration::from_millis(5),
        })
    }
}

// ---------------------------------------------------------------------------
// MockQueue
// ---------------------------------------------------------------------------

/// In-memory [`WorkQueue`] with the same transition semantics as the
/// Postgres implementation, including visibility-timeout reclaim and
/// owner-guarded terminal updates.
#[derive(Clone)]
pub struct MockQueue {
    entries: Arc<Mutex<Vec<QueueEntry>>>,
    next_id: Arc<AtomicI64>,
    config: QueueConfig,
}

impl MockQueue {
    pub fn empty() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            config,
        }
    }

    pub fn status_of(&self, entry_id: i64) -> Option<QueueStatus> {
        self.entry(entry_id).map(|e| e.status)
    }

    pub fn entry(&self, entry_id: i64) -> Option<QueueEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == entry_id)
            .cloned()
    }

    /// Backdate an entry's lock, simulating an abandoned worker.
    pub fn age_lock(&self, entry_id: i64, by: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == entry_id)
            && let Some(locked_at) = entry.locked_at
        {
            entry.locked_at =
                Some(locked_at - TimeDelta::from_std(by).unwrap_or(TimeDelta::zero()));
        }
    }
}

impl WorkQueue for MockQueue {
    async fn enqueue(&self, key: &CompanyKey) -> Result<EnqueueOutcome, AppError> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| e.key == *key && e.status.is_active())
        {
            return Ok(EnqueueOutcome::AlreadyActive);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        entries.push(QueueEntry {
            id,
            key: key.clone(),
            status: QueueStatus::Queued,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            available_at: now,
            locked_at: None,
            locked_by: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn enqueue_batch(&self, keys: &[CompanyKey]) -> Result<BatchEnqueueResult, AppError> {
        let mut result = BatchEnqueueResult {
            enqueued: Vec::new(),
            skipped: Vec::new(),
        };
        for key in keys {
            match self.enqueue(key).await? {
                EnqueueOutcome::Enqueued(_) => result.enqueued.push(key.clone()),
                EnqueueOutcome::AlreadyActive => result.skipped.push(key.clone()),
            }
        }
        Ok(result)
    }

    async fn claim(&self, owner: &str, batch: usize) -> Result<Vec<QueueEntry>, AppError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Utc::now();
        let visibility =
            TimeDelta::from_std(self.config.visibility_timeout).unwrap_or(TimeDelta::zero());

        let mut claimable: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| match e.status {
                QueueStatus::Queued => e.available_at <= now,
                QueueStatus::Processing => {
                    e.locked_at.is_some_and(|locked| now - locked > visibility)
                }
                _ => false,
            })
            .map(|(i, _)| i)
            .collect();
        claimable.sort_by_key(|&i| (entries[i].available_at, entries[i].id));
        claimable.truncate(batch);

        let mut claimed = Vec::new();
        for i in claimable {
            let entry = &mut entries[i];
            entry.status = QueueStatus::Processing;
            entry.locked_at = Some(now);
            entry.locked_by = Some(owner.to_string());
            entry.updated_at = now;
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, entry_id: i64, owner: &str) -> Result<(), AppError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| {
            e.id == entry_id
                && e.status == QueueStatus::Processing
                && e.locked_by.as_deref() == Some(owner)
        }) {
            entry.status = QueueStatus::Done;
            entry.locked_at = None;
            entry.locked_by = None;
            entry.last_error = None;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_or_retry(
        &self,
        entry_id: i64,
        owner: &str,
        error: &str,
    ) -> Result<FailOutcome, AppError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.iter_mut().find(|e| e.id == entry_id) else {
            return Ok(FailOutcome::NotOwned);
        };
        if entry.status != QueueStatus::Processing || entry.locked_by.as_deref() != Some(owner) {
            return Ok(FailOutcome::NotOwned);
        }

        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.locked_at = None;
        entry.locked_by = None;
        entry.updated_at = Utc::now();

        if entry.attempts >= entry.max_attempts {
            entry.status = QueueStatus::Failed;
            Ok(FailOutcome::Dead)
        } else {
            let delay = self.config.retry.delay_for_attempt(entry.attempts);
            entry.status = QueueStatus::Queued;
            entry.available_at = Utc::now() + delay;
            Ok(FailOutcome::Retried {
                next_available_in: delay.to_std().unwrap_or_default(),
            })
        }
    }

    async fn metrics(&self) -> Result<QueueMetrics, AppError> {
        let entries = self.entries.lock().unwrap();
        let now = Utc::now();
        let mut metrics = QueueMetrics::default();
        for entry in entries.iter() {
            match entry.status {
                QueueStatus::Queued => metrics.queued += 1,
                QueueStatus::Processing => metrics.processing += 1,
                QueueStatus::Done => metrics.done += 1,
                QueueStatus::Failed => metrics.failed += 1,
            }
        }
        metrics.oldest_queued_age_seconds = entries
            .iter()
            .filter(|e| e.status == QueueStatus::Queued)
            .map(|e| (now - e.created_at).num_milliseconds() as f64 / 1000.0)
            .fold(None, |acc: Option<f64>, age| {
                Some(acc.map_or(age, |a| a.max(age)))
            });
        Ok(metrics)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::EntryClaimed { .. } => "EntryClaimed",
            WorkerEvent::EntryCompleted { .. } => "EntryCompleted",
            WorkerEvent::EntryFailed { .. } => "EntryFailed",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Stage stores
// ---------------------------------------------------------------------------

/// In-memory [`SearchStore`].
#[derive(Clone, Default)]
pub struct MockSearchStore {
    rows: Arc<Mutex<Vec<SearchResult>>>,
    next_id: Arc<AtomicI64>,
}

impl MockSearchStore {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl SearchStore for MockSearchStore {
    async fn save_search(&self, result: &NewSearchResult) -> Result<i64, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.lock().unwrap().push(SearchResult {
            id,
            key: result.key.clone(),
            query: result.query.clone(),
            hits: result.hits.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn latest_search(&self, key: &CompanyKey) -> Result<Option<SearchResult>, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.key == *key)
            .cloned())
    }
}

/// In-memory [`DiscoveryStore`].
#[derive(Clone, Default)]
pub struct MockDiscoveryStore {
    rows: Arc<Mutex<HashMap<String, DiscoveryResult>>>,
}

impl MockDiscoveryStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CompanyKey) -> Option<DiscoveryResult> {
        self.rows.lock().unwrap().get(key.as_str()).cloned()
    }
}

impl DiscoveryStore for MockDiscoveryStore {
    async fn upsert_discovery(&self, result: &DiscoveryResult) -> Result<(), AppError> {
        self.rows
            .lock()
            .unwrap()
            .insert(result.key.as_str().to_string(), result.clone());
        Ok(())
    }

    async fn get_discovery(&self, key: &CompanyKey) -> Result<Option<DiscoveryResult>, AppError> {
        Ok(self.get(key))
    }
}

/// In-memory [`ChunkStore`] that counts replacements.
#[derive(Clone, Default)]
pub struct MockChunkStore {
    rows: Arc<Mutex<HashMap<String, Vec<ScrapedChunk>>>>,
    replaces: Arc<AtomicI64>,
}

impl MockChunkStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn chunks(&self, key: &CompanyKey) -> Vec<ScrapedChunk> {
        self.rows
            .lock()
            .unwrap()
            .get(key.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn replace_calls(&self) -> i64 {
        self.replaces.load(Ordering::SeqCst)
    }
}

impl ChunkStore for MockChunkStore {
    async fn replace_chunks(
        &self,
        key: &CompanyKey,
        chunks: &[ScrapedChunk],
    ) -> Result<usize, AppError> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), chunks.to_vec());
        Ok(chunks.len())
    }

    async fn get_chunks(&self, key: &CompanyKey) -> Result<Vec<ScrapedChunk>, AppError> {
        Ok(self.chunks(key))
    }
}

/// In-memory [`ProfileStore`].
#[derive(Clone, Default)]
pub struct MockProfileStore {
    rows: Arc<Mutex<HashMap<String, (CompanyProfile, StageStatus)>>>,
}

impl MockProfileStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CompanyKey) -> Option<(CompanyProfile, StageStatus)> {
        self.rows.lock().unwrap().get(key.as_str()).cloned()
    }
}

impl ProfileStore for MockProfileStore {
    async fn upsert_profile(
        &self,
        key: &CompanyKey,
        profile: &CompanyProfile,
        status: StageStatus,
    ) -> Result<(), AppError> {
        self.rows
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), (profile.clone(), status));
        Ok(())
    }
}

/// In-memory [`KnowledgeStore`].
#[derive(Clone, Default)]
pub struct MockKnowledgeStore {
    rows: Arc<Mutex<HashMap<String, SiteKnowledge>>>,
}

impl MockKnowledgeStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn knowledge(&self, origin: &str) -> Option<SiteKnowledge> {
        self.rows.lock().unwrap().get(origin).cloned()
    }
}

impl KnowledgeStore for MockKnowledgeStore {
    async fn get_knowledge(&self, origin: &str) -> Result<Option<SiteKnowledge>, AppError> {
        Ok(self.knowledge(origin))
    }

    async fn upsert_knowledge(&self, knowledge: &SiteKnowledge) -> Result<(), AppError> {
        self.rows
            .lock()
            .unwrap()
            .insert(knowledge.origin.clone(), knowledge.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scrape-pipeline mocks
// ---------------------------------------------------------------------------

/// Prober that always resolves to a fixed URL and strategy order.
#[derive(Clone)]
pub struct MockProber {
    url: String,
    strategies: Vec<FetchStrategy>,
}

impl MockProber {
    pub fn returning(url: &str, strategies: &[FetchStrategy]) -> Self {
        Self {
            url: url.to_string(),
            strategies: strategies.to_vec(),
        }
    }
}

impl SiteProber for MockProber {
    async fn probe(
        &self,
        _base_url: &str,
        _knowledge: Option<&SiteKnowledge>,
    ) -> Result<SiteProfile, AppError> {
        Ok(SiteProfile {
            url: self.url.clone(),
            latency: Duration::from_millis(120),
            site_type: SiteType::Static,
            protection: None,
            strategies: self.strategies.clone(),
        })
    }
}

enum ScriptedFetch {
    Once(Result<String, ()>),
    Repeating(String),
    Protection(ProtectionKind),
    Transport(String),
}

/// Fetcher scripted per (url, strategy) pair.
#[derive(Clone)]
pub struct MockStrategyFetcher {
    scripts: Arc<Mutex<HashMap<(String, FetchStrategy), Vec<ScriptedFetch>>>>,
}

impl MockStrategyFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn push(&self, url: &str, strategy: FetchStrategy, fetch: ScriptedFetch) {
        self.scripts
            .lock()
            .unwrap()
            .entry((url.to_string(), strategy))
            .or_default()
            .push(fetch);
    }

    pub fn ok(&self, url: &str, strategy: FetchStrategy, body: &str) {
        self.push(url, strategy, ScriptedFetch::Once(Ok(body.to_string())));
    }

    pub fn ok_repeating(&self, url: &str, strategy: FetchStrategy, body: &str) {
        self.push(url, strategy, ScriptedFetch::Repeating(body.to_string()));
    }

    pub fn protection(&self, url: &str, strategy: FetchStrategy, kind: ProtectionKind) {
        self.push(url, strategy, ScriptedFetch::Protection(kind));
    }

    pub fn transport(&self, url: &str, strategy: FetchStrategy, message: &str) {
        self.push(url, strategy, ScriptedFetch::Transport(message.to_string()));
    }
}

impl Default for MockStrategyFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFetcher for MockStrategyFetcher {
    async fn fetch(&self, url: &str, strategy: FetchStrategy) -> Result<FetchedPage, AppError> {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(&(url.to_string(), strategy)) else {
            return Err(AppError::Transport(format!(
                "no scripted response for {url} under {strategy}"
            )));
        };
        if queue.is_empty() {
            return Err(AppError::Transport(format!(
                "scripted responses exhausted for {url} under {strategy}"
            )));
        }
        let next = match &queue[0] {
            ScriptedFetch::Repeating(body) => {
                let body = body.clone();
                return Ok(FetchedPage {
                    url: url.to_string(),
                    body,
                    status: 200,
                    strategy_used: strategy,
                    elapsed: Duration::from_millis(10),
                });
            }
            _ => queue.remove(0),
        };
        match next {
            ScriptedFetch::Once(Ok(body)) => Ok(FetchedPage {
                url: url.to_string(),
                body,
                status: 200,
                strategy_used: strategy,
                elapsed: Duration::from_millis(10),
            }),
            ScriptedFetch::Once(Err(())) => {
                Err(AppError::Transport(format!("scripted failure for {url}")))
            }
            ScriptedFetch::Protection(kind) => Err(AppError::ProtectionDetected(kind)),
            ScriptedFetch::Transport(message) => Err(AppError::Transport(message)),
            ScriptedFetch::Repeating(_) => unreachable!("handled above"),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

/// Cleaner that returns input unchanged and harvests `href="…"` values.
#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        let mut err = self.error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        Ok(html.to_string())
    }

    fn extract_links(&self, html: &str) -> Vec<String> {
        let mut links = Vec::new();
        let mut rest = html;
        while let Some(pos) = rest.find("href=\"") {
            rest = &rest[pos + 6..];
            if let Some(end) = rest.find('"') {
                links.push(rest[..end].to_string());
                rest = &rest[end..];
            } else {
                break;
            }
        }
        links
    }
}
