pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
