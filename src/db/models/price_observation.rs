use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PoolKey;

/// One price sample for a pool (PostgreSQL `price_data`).
///
/// Unique Key: (network, pool_address, timestamp)
/// Append-only; rows are never updated once written.
///
/// `log_return` is `ln(price / previous_price)` against the immediately
/// preceding observation of the same pool, or `None` when there is no
/// predecessor or the gap to it breaks continuity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceObservation {
    pub pool: PoolKey,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume_usd: Option<f64>,
    pub log_return: Option<f64>,
}

/// Data-quality counters over all observations of a pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationStats {
    pub count: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}
