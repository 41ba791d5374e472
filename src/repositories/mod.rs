pub mod aggregate_repository;
pub mod difficulty_repository;
pub mod settlement_repository;
pub mod yield_repository;

// Re-export all repositories for convenient access
pub use aggregate_repository::AggregateRepository;
pub use difficulty_repository::DifficultyRepository;
pub use settlement_repository::SettlementRepository;
pub use yield_repository::{YieldKey, YieldRepository};
