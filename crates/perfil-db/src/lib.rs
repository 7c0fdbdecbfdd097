pub mod config;
pub mod database;
pub mod knowledge_repository;
pub mod queue_repository;
pub mod stage_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use knowledge_repository::KnowledgeRepository;
pub use queue_repository::{QueueName, QueueRepository};
pub use stage_repository::StageRepository;
