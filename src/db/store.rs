use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{
    Alert, AlertType, ApiUsageCounter, FvrHistoryPoint, HistoryWrite, ObservationStats, Pool,
    PoolAnalyticsSnapshot, PoolKey, PriceObservation, Tier, TrackedPool, VolatilityHistoryPoint,
};

/// Persistence contract of the engine.
///
/// Implemented by [`PostgresClient`](crate::db::PostgresClient) for the
/// service and by [`MemoryStore`](crate::db::MemoryStore) for tests. Both
/// enforce the same uniqueness rules: observations are unique per
/// (pool, timestamp), history rows per (pool, date[, period_days]), usage
/// counters per (service, endpoint, hour_bucket).
#[async_trait]
pub trait Store: Send + Sync {
    // ==================== POOLS & TIERS ====================

    /// Insert a pool on first discovery. Existing pools keep their metadata.
    async fn upsert_pool(&self, pool: &Pool) -> Result<()>;

    async fn set_pool_active(&self, key: &PoolKey, is_active: bool) -> Result<()>;

    /// Assign (or reassign) the tier of one logical position on a pool.
    async fn set_position_tier(&self, key: &PoolKey, position: &str, tier: Tier) -> Result<()>;

    /// Active pools with at least one position, each with its most urgent tier.
    async fn tracked_pools(&self) -> Result<Vec<TrackedPool>>;

    // ==================== OBSERVATIONS ====================

    async fn latest_observation_before(
        &self,
        key: &PoolKey,
        before: DateTime<Utc>,
    ) -> Result<Option<PriceObservation>>;

    /// Observations with `from <= timestamp <= to`, oldest first.
    async fn observations_between(
        &self,
        key: &PoolKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>>;

    /// Append observations; rows whose (pool, timestamp) exists are skipped.
    /// Returns the number of rows actually written.
    async fn insert_observations(&self, observations: &[PriceObservation]) -> Result<u64>;

    /// `log_return` of the `limit` most recent observations, oldest first.
    async fn recent_log_returns(&self, key: &PoolKey, limit: usize) -> Result<Vec<Option<f64>>>;

    async fn observation_stats(&self, key: &PoolKey) -> Result<ObservationStats>;

    // ==================== SNAPSHOTS ====================

    async fn get_snapshot(&self, key: &PoolKey) -> Result<Option<PoolAnalyticsSnapshot>>;

    /// Overwrite the snapshot unless the stored one is newer.
    /// Returns false when the write was discarded as stale.
    async fn upsert_snapshot(&self, snapshot: &PoolAnalyticsSnapshot) -> Result<bool>;

    /// Record a failed run without touching metrics or data-quality counters.
    async fn record_pool_failure(&self, key: &PoolKey, error: &str, at: DateTime<Utc>)
        -> Result<()>;

    // ==================== HISTORY ====================

    async fn insert_volatility_history(&self, point: &VolatilityHistoryPoint)
        -> Result<HistoryWrite>;

    async fn insert_fvr_history(&self, point: &FvrHistoryPoint) -> Result<HistoryWrite>;

    async fn volatility_history(&self, key: &PoolKey) -> Result<Vec<VolatilityHistoryPoint>>;

    async fn fvr_history(&self, key: &PoolKey) -> Result<Vec<FvrHistoryPoint>>;

    // ==================== API USAGE ====================

    /// Increment-or-insert the counter for (service, endpoint, hour_bucket).
    async fn increment_api_usage(
        &self,
        service: &str,
        endpoint: &str,
        hour_bucket: DateTime<Utc>,
    ) -> Result<()>;

    async fn api_usage_since(&self, service: &str, since: DateTime<Utc>)
        -> Result<Vec<ApiUsageCounter>>;

    // ==================== ALERTS ====================

    async fn create_alert(
        &self,
        key: &PoolKey,
        alert_type: AlertType,
        threshold_value: f64,
    ) -> Result<i64>;

    async fn active_alerts(&self, key: &PoolKey) -> Result<Vec<Alert>>;

    async fn mark_alert_triggered(&self, alert_id: i64, at: DateTime<Utc>) -> Result<()>;
}
