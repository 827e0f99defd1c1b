use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ObservationStats, PoolKey};
use crate::analytics::fvr::Recommendation;

/// Current analytics state of a pool (PostgreSQL `pool_analytics`).
///
/// Primary Key: (network, pool_address)
/// One row per pool, overwritten by every successful pipeline run of that
/// pool. `last_updated` only moves forward; a write carrying an older
/// timestamp is discarded by the store.
///
/// Query Patterns:
///   - "Get current FVR / IL risk for pool X"
///   - "List pools by recommendation"
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolAnalyticsSnapshot {
    pub pool: PoolKey,

    // Market state from the metadata provider
    pub tvl_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub volume_7d_usd: Option<f64>,
    pub fees_24h_usd: Option<f64>,
    pub fee_apr: Option<f64>,

    // Annualized volatility per window
    pub volatility_1d: Option<f64>,
    pub volatility_7d: Option<f64>,
    pub volatility_30d: Option<f64>,

    // Fee-to-volatility
    pub fvr: Option<f64>,
    pub recommendation: Option<Recommendation>,

    // Impermanent loss
    pub il_risk_score: Option<i16>,
    pub expected_il_30d: Option<f64>,
    pub breakeven_fee_apr: Option<f64>,

    // Data quality
    pub data_points_count: i64,
    pub oldest_data_point: Option<DateTime<Utc>>,
    pub newest_data_point: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,

    /// None only for rows created by a failure before any successful run
    pub last_updated: Option<DateTime<Utc>>,
}

impl PoolAnalyticsSnapshot {
    pub fn new(pool: PoolKey, updated_at: DateTime<Utc>) -> Self {
        Self {
            pool,
            last_updated: Some(updated_at),
            ..Default::default()
        }
    }

    pub fn with_stats(mut self, stats: &ObservationStats) -> Self {
        self.data_points_count = stats.count;
        self.oldest_data_point = stats.oldest;
        self.newest_data_point = stats.newest;
        self
    }

    /// Volatility used for FVR and IL: the longest window available.
    pub fn reference_volatility(&self) -> Option<f64> {
        self.volatility_30d
            .or(self.volatility_7d)
            .or(self.volatility_1d)
    }
}
