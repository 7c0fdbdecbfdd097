use perfil_client::{HtmdCleaner, OpenAiCompatVendor, ReqwestFetcher, ReqwestProber, SerperClient};
use perfil_core::links::LlmLinkRanker;
use perfil_core::scrape::ScrapeService;
use perfil_db::{Database, KnowledgeRepository, QueueRepository, StageRepository};

/// The facade's concrete scrape-service wiring.
pub type AppScrapeService = ScrapeService<
    ReqwestProber,
    ReqwestFetcher,
    HtmdCleaner,
    LlmLinkRanker<OpenAiCompatVendor>,
    StageRepository,
    KnowledgeRepository,
>;

/// Shared application state, available to all route handlers via
/// `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    /// Shared secret for the `x-api-key` header (None = auth disabled).
    pub api_token: Option<String>,
    pub search: SerperClient,
    pub scraper: AppScrapeService,
    pub discovery_queue: QueueRepository,
    pub profile_queue: QueueRepository,
}
