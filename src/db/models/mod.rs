pub mod alert;
pub mod analytics_snapshot;
pub mod api_usage;
pub mod history;
pub mod pool;
pub mod price_observation;

pub use alert::{Alert, AlertEvent, AlertType, Breach};
pub use analytics_snapshot::PoolAnalyticsSnapshot;
pub use api_usage::ApiUsageCounter;
pub use history::{FvrHistoryPoint, HistoryWrite, VolatilityHistoryPoint};
pub use pool::{Pool, PoolKey, Tier, TrackedPool};
pub use price_observation::{ObservationStats, PriceObservation};
