#[allow(clippy::module_inception)]
mod config;

pub use config::{
    AnalyticsSettings, FetchSettings, PostgresSettings, PromotionSettings, ProviderSettings,
    RateLimitSettings, SchedulerSettings, Settings, TrackedPoolSettings,
};
