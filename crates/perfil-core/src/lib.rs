pub mod breaker;
pub mod chunker;
pub mod discovery;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod key;
pub mod links;
pub mod llm;
pub mod models;
pub mod probe;
pub mod profile;
pub mod queue;
pub mod rate_gate;
pub mod scrape;
pub mod search;
pub mod stages;
pub mod stores;
pub mod testutil;
pub mod util;
pub mod worker;

pub use error::AppError;
pub use key::CompanyKey;
pub use models::{DiscoveryResult, DiscoveryStatus, ScrapedChunk, SearchHit, SearchResult, SiteKnowledge, compute_hash};
pub use profile::CompanyProfile;
pub use queue::{EnqueueOutcome, QueueEntry, QueueMetrics, QueueStatus, WorkQueue};
pub use scrape::{ScrapeService, ScrapeSummary};
pub use worker::{StageWorker, TracingWorkerReporter, WorkerConfig};
