use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rustc_hash::FxHashMap;

use crate::db::models::{
    Alert, AlertType, ApiUsageCounter, FvrHistoryPoint, HistoryWrite, ObservationStats, Pool,
    PoolAnalyticsSnapshot, PoolKey, PriceObservation, Tier, TrackedPool, VolatilityHistoryPoint,
};
use crate::db::Store;

#[derive(Default)]
struct Inner {
    pools: BTreeMap<PoolKey, Pool>,
    positions: BTreeMap<(PoolKey, String), Tier>,
    observations: FxHashMap<PoolKey, BTreeMap<DateTime<Utc>, PriceObservation>>,
    snapshots: FxHashMap<PoolKey, PoolAnalyticsSnapshot>,
    volatility_history: BTreeMap<(PoolKey, NaiveDate, i16), VolatilityHistoryPoint>,
    fvr_history: BTreeMap<(PoolKey, NaiveDate), FvrHistoryPoint>,
    api_usage: BTreeMap<(String, String, DateTime<Utc>), i64>,
    alerts: BTreeMap<i64, Alert>,
    next_alert_id: i64,
}

/// In-process [`Store`] with the same uniqueness and monotonicity rules as
/// the PostgreSQL schema. Backs the test suite and offline experiments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-applied write
        // behind, every mutation is a single map operation.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn observation_count(&self, key: &PoolKey) -> usize {
        self.inner()
            .observations
            .get(key)
            .map(|o| o.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_pool(&self, pool: &Pool) -> Result<()> {
        self.inner()
            .pools
            .entry(pool.key())
            .or_insert_with(|| pool.clone());
        Ok(())
    }

    async fn set_pool_active(&self, key: &PoolKey, is_active: bool) -> Result<()> {
        if let Some(pool) = self.inner().pools.get_mut(key) {
            pool.is_active = is_active;
        }
        Ok(())
    }

    async fn set_position_tier(&self, key: &PoolKey, position: &str, tier: Tier) -> Result<()> {
        self.inner()
            .positions
            .insert((key.clone(), position.to_string()), tier);
        Ok(())
    }

    async fn tracked_pools(&self) -> Result<Vec<TrackedPool>> {
        let inner = self.inner();

        let mut tiers: BTreeMap<&PoolKey, Tier> = BTreeMap::new();
        for ((key, _), tier) in &inner.positions {
            tiers
                .entry(key)
                .and_modify(|t| *t = (*t).min(*tier))
                .or_insert(*tier);
        }

        let tracked = tiers
            .into_iter()
            .filter_map(|(key, tier)| {
                let pool = inner.pools.get(key).filter(|p| p.is_active)?;
                let snapshot = inner.snapshots.get(key);
                Some(TrackedPool {
                    pool: pool.clone(),
                    tier,
                    last_updated: snapshot.and_then(|s| s.last_updated),
                    last_error_at: snapshot.and_then(|s| s.last_error_at),
                })
            })
            .collect();

        Ok(tracked)
    }

    async fn latest_observation_before(
        &self,
        key: &PoolKey,
        before: DateTime<Utc>,
    ) -> Result<Option<PriceObservation>> {
        Ok(self
            .inner()
            .observations
            .get(key)
            .and_then(|o| o.range(..before).next_back())
            .map(|(_, obs)| obs.clone()))
    }

    async fn observations_between(
        &self,
        key: &PoolKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>> {
        if from > to {
            return Ok(vec![]);
        }
        Ok(self
            .inner()
            .observations
            .get(key)
            .map(|o| o.range(from..=to).map(|(_, obs)| obs.clone()).collect())
            .unwrap_or_default())
    }

    async fn insert_observations(&self, observations: &[PriceObservation]) -> Result<u64> {
        let mut inner = self.inner();
        let mut inserted = 0;

        for obs in observations {
            let series = inner.observations.entry(obs.pool.clone()).or_default();
            if !series.contains_key(&obs.timestamp) {
                series.insert(obs.timestamp, obs.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn recent_log_returns(&self, key: &PoolKey, limit: usize) -> Result<Vec<Option<f64>>> {
        let inner = self.inner();
        let Some(series) = inner.observations.get(key) else {
            return Ok(vec![]);
        };

        let mut returns: Vec<Option<f64>> = series
            .values()
            .rev()
            .take(limit)
            .map(|obs| obs.log_return)
            .collect();
        returns.reverse();

        Ok(returns)
    }

    async fn observation_stats(&self, key: &PoolKey) -> Result<ObservationStats> {
        let inner = self.inner();
        let Some(series) = inner.observations.get(key) else {
            return Ok(ObservationStats::default());
        };

        Ok(ObservationStats {
            count: series.len() as i64,
            oldest: series.keys().next().copied(),
            newest: series.keys().next_back().copied(),
        })
    }

    async fn get_snapshot(&self, key: &PoolKey) -> Result<Option<PoolAnalyticsSnapshot>> {
        Ok(self.inner().snapshots.get(key).cloned())
    }

    async fn upsert_snapshot(&self, snapshot: &PoolAnalyticsSnapshot) -> Result<bool> {
        let mut inner = self.inner();

        if let Some(existing) = inner.snapshots.get(&snapshot.pool) {
            if existing.last_updated > snapshot.last_updated {
                return Ok(false);
            }
        }

        inner
            .snapshots
            .insert(snapshot.pool.clone(), snapshot.clone());
        Ok(true)
    }

    async fn record_pool_failure(
        &self,
        key: &PoolKey,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner();
        let snapshot = inner
            .snapshots
            .entry(key.clone())
            .or_insert_with(|| PoolAnalyticsSnapshot {
                pool: key.clone(),
                ..Default::default()
            });
        snapshot.last_error = Some(error.to_string());
        snapshot.last_error_at = Some(at);
        Ok(())
    }

    async fn insert_volatility_history(
        &self,
        point: &VolatilityHistoryPoint,
    ) -> Result<HistoryWrite> {
        let mut inner = self.inner();
        let key = (point.pool.clone(), point.date, point.period_days);

        if inner.volatility_history.contains_key(&key) {
            return Ok(HistoryWrite::AlreadyRecorded);
        }
        inner.volatility_history.insert(key, point.clone());
        Ok(HistoryWrite::Inserted)
    }

    async fn insert_fvr_history(&self, point: &FvrHistoryPoint) -> Result<HistoryWrite> {
        let mut inner = self.inner();
        let key = (point.pool.clone(), point.date);

        if inner.fvr_history.contains_key(&key) {
            return Ok(HistoryWrite::AlreadyRecorded);
        }
        inner.fvr_history.insert(key, point.clone());
        Ok(HistoryWrite::Inserted)
    }

    async fn volatility_history(&self, key: &PoolKey) -> Result<Vec<VolatilityHistoryPoint>> {
        Ok(self
            .inner()
            .volatility_history
            .values()
            .filter(|p| &p.pool == key)
            .cloned()
            .collect())
    }

    async fn fvr_history(&self, key: &PoolKey) -> Result<Vec<FvrHistoryPoint>> {
        Ok(self
            .inner()
            .fvr_history
            .values()
            .filter(|p| &p.pool == key)
            .cloned()
            .collect())
    }

    async fn increment_api_usage(
        &self,
        service: &str,
        endpoint: &str,
        hour_bucket: DateTime<Utc>,
    ) -> Result<()> {
        *self
            .inner()
            .api_usage
            .entry((service.to_string(), endpoint.to_string(), hour_bucket))
            .or_insert(0) += 1;
        Ok(())
    }

    async fn api_usage_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiUsageCounter>> {
        Ok(self
            .inner()
            .api_usage
            .iter()
            .filter(|((s, _, bucket), _)| s == service && *bucket >= since)
            .map(|((s, endpoint, bucket), count)| ApiUsageCounter {
                service: s.clone(),
                endpoint: endpoint.clone(),
                hour_bucket: *bucket,
                request_count: *count,
            })
            .collect())
    }

    async fn create_alert(
        &self,
        key: &PoolKey,
        alert_type: AlertType,
        threshold_value: f64,
    ) -> Result<i64> {
        let mut inner = self.inner();
        inner.next_alert_id += 1;
        let id = inner.next_alert_id;

        inner.alerts.insert(
            id,
            Alert {
                id,
                pool: key.clone(),
                alert_type,
                threshold_value,
                is_active: true,
                last_triggered: None,
            },
        );
        Ok(id)
    }

    async fn active_alerts(&self, key: &PoolKey) -> Result<Vec<Alert>> {
        Ok(self
            .inner()
            .alerts
            .values()
            .filter(|a| a.is_active && &a.pool == key)
            .cloned()
            .collect())
    }

    async fn mark_alert_triggered(&self, alert_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(alert) = self.inner().alerts.get_mut(&alert_id) {
            alert.last_triggered = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::fvr::Recommendation;
    use chrono::{Duration, TimeZone};

    fn key() -> PoolKey {
        PoolKey::new("ethereum", "0xpool")
    }

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, hour, 0, 0).unwrap()
    }

    fn obs(hour: u32, price: f64) -> PriceObservation {
        PriceObservation {
            pool: key(),
            timestamp: t(hour),
            price,
            volume_usd: None,
            log_return: None,
        }
    }

    #[tokio::test]
    async fn test_observations_unique_per_timestamp() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .insert_observations(&[obs(1, 1.0), obs(2, 2.0)])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .insert_observations(&[obs(2, 9.0), obs(3, 3.0)])
                .await
                .unwrap(),
            1
        );

        let rows = store.observations_between(&key(), t(0), t(23)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].price, 2.0);

        let before = store.latest_observation_before(&key(), t(3)).await.unwrap();
        assert_eq!(before.unwrap().timestamp, t(2));
    }

    #[tokio::test]
    async fn test_snapshot_is_monotonic() {
        let store = MemoryStore::new();
        let newer = PoolAnalyticsSnapshot::new(key(), t(5));
        let older = PoolAnalyticsSnapshot::new(key(), t(4));

        assert!(store.upsert_snapshot(&newer).await.unwrap());
        assert!(!store.upsert_snapshot(&older).await.unwrap());
        assert_eq!(
            store.get_snapshot(&key()).await.unwrap().unwrap().last_updated,
            Some(t(5))
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_metrics() {
        let store = MemoryStore::new();
        let mut snapshot = PoolAnalyticsSnapshot::new(key(), t(5));
        snapshot.data_points_count = 42;
        store.upsert_snapshot(&snapshot).await.unwrap();

        store
            .record_pool_failure(&key(), "data unavailable", t(6))
            .await
            .unwrap();

        let stored = store.get_snapshot(&key()).await.unwrap().unwrap();
        assert_eq!(stored.data_points_count, 42);
        assert_eq!(stored.last_updated, Some(t(5)));
        assert_eq!(stored.last_error_at, Some(t(6)));
    }

    #[tokio::test]
    async fn test_history_append_once() {
        let store = MemoryStore::new();
        let date = t(0).date_naive();
        let vol = VolatilityHistoryPoint {
            pool: key(),
            date,
            period_days: 7,
            value: 0.5,
        };
        let fvr = FvrHistoryPoint {
            pool: key(),
            date,
            fvr: 1.2,
            fee_apr: 0.6,
            volatility: 0.5,
            recommendation: Recommendation::Attractive,
        };

        assert_eq!(
            store.insert_volatility_history(&vol).await.unwrap(),
            HistoryWrite::Inserted
        );
        assert_eq!(
            store
                .insert_volatility_history(&VolatilityHistoryPoint { value: 0.9, ..vol.clone() })
                .await
                .unwrap(),
            HistoryWrite::AlreadyRecorded
        );
        assert_eq!(
            store
                .insert_volatility_history(&VolatilityHistoryPoint { period_days: 30, ..vol })
                .await
                .unwrap(),
            HistoryWrite::Inserted
        );
        assert_eq!(
            store.insert_fvr_history(&fvr).await.unwrap(),
            HistoryWrite::Inserted
        );
        assert_eq!(
            store.insert_fvr_history(&fvr).await.unwrap(),
            HistoryWrite::AlreadyRecorded
        );

        let history = store.volatility_history(&key()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, 0.5);
    }

    #[tokio::test]
    async fn test_tracked_pools_use_most_urgent_tier() {
        let store = MemoryStore::new();
        let pool = Pool::new("ethereum", "0xpool", "0xa", "0xb", "A", "B", 3000, "uniswap-v3");
        let idle = Pool::new("ethereum", "0xidle", "0xa", "0xb", "A", "B", 3000, "uniswap-v3");
        store.upsert_pool(&pool).await.unwrap();
        store.upsert_pool(&idle).await.unwrap();

        store
            .set_position_tier(&key(), "lp-1", Tier::Screening)
            .await
            .unwrap();
        store
            .set_position_tier(&key(), "lp-2", Tier::Watchlist)
            .await
            .unwrap();

        let tracked = store.tracked_pools().await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].tier, Tier::Watchlist);

        store.set_pool_active(&key(), false).await.unwrap();
        assert!(store.tracked_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_usage_counts_per_bucket() {
        let store = MemoryStore::new();
        store.increment_api_usage("gecko", "ohlcv", t(1)).await.unwrap();
        store.increment_api_usage("gecko", "ohlcv", t(1)).await.unwrap();
        store.increment_api_usage("gecko", "ohlcv", t(2)).await.unwrap();
        store.increment_api_usage("llama", "pools", t(2)).await.unwrap();

        let usage = store.api_usage_since("gecko", t(0)).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].request_count, 2);

        let recent = store
            .api_usage_since("gecko", t(2) - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
