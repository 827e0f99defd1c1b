pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod scheduler;
pub mod utils;

pub use config::Settings;
pub use db::Database;
pub use fetch::{FetchClient, RateLimiterSet};
pub use scheduler::{PoolPipeline, PromotionPolicy, TierScheduler};
