use chrono::NaiveDate;
use serde::Serialize;

use super::PoolKey;
use crate::analytics::fvr::Recommendation;

/// Daily volatility trend point (PostgreSQL `volatility_history`).
///
/// Unique Key: (network, pool_address, date, period_days)
/// Query Pattern: "Get 30d volatility trend for pool X"
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatilityHistoryPoint {
    pub pool: PoolKey,
    pub date: NaiveDate,
    /// 1, 7 or 30
    pub period_days: i16,
    pub value: f64,
}

/// Daily fee-to-volatility trend point (PostgreSQL `fvr_history`).
///
/// Unique Key: (network, pool_address, date)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FvrHistoryPoint {
    pub pool: PoolKey,
    pub date: NaiveDate,
    pub fvr: f64,
    pub fee_apr: f64,
    pub volatility: f64,
    pub recommendation: Recommendation,
}

/// Outcome of an append-once history insert.
///
/// A row already present for the same key is not an error: the first
/// computation of the day wins and later ones only touch the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWrite {
    Inserted,
    AlreadyRecorded,
}
