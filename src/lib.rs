pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod risk;
pub mod scheduler;

pub use aggregator::RiskAggregator;
pub use config::AggregatorConfig;
pub use error::AggregatorError;
