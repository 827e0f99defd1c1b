//! One refresh of one pool: fetch, ingest, compute, persist, alert.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::analytics::volatility::MIN_SAMPLES;
use crate::analytics::{fvr, AlertEvaluator, IlEstimator, Ingestor, Recommendation, SamplingFrequency, VolatilitySet};
use crate::config::{AnalyticsSettings, SchedulerSettings};
use crate::db::models::{
    AlertEvent, FvrHistoryPoint, HistoryWrite, ObservationStats, Pool, PoolAnalyticsSnapshot,
    VolatilityHistoryPoint,
};
use crate::db::Store;
use crate::error::DataQualityIssue;
use crate::fetch::{FetchClient, PoolMetadata};
use crate::scheduler::tier::PromotionPolicy;

/// What a single pipeline run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub new_observations: u64,
    /// False when a newer snapshot was already stored
    pub snapshot_written: bool,
    pub history_rows: usize,
    pub alerts_fired: usize,
    pub promoted: bool,
}

/// Market fields of the last snapshot, reused when metadata cannot be fetched.
fn carried_metadata(previous: Option<&PoolAnalyticsSnapshot>) -> PoolMetadata {
    previous
        .map(|s| PoolMetadata {
            tvl_usd: s.tvl_usd,
            volume_24h_usd: s.volume_24h_usd,
            volume_7d_usd: s.volume_7d_usd,
            fee_apr_pct: s.fee_apr.map(|apr| apr * 100.0),
        })
        .unwrap_or_default()
}

/// Runs the per-pool refresh. Shared by all workers of the scheduler.
pub struct PoolPipeline {
    store: Arc<dyn Store>,
    fetch: Arc<FetchClient>,
    ingestor: Ingestor,
    il: IlEstimator,
    alerts: AlertEvaluator,
    promotion: Arc<PromotionPolicy>,
    sampling: SamplingFrequency,
    initial_lookback: Duration,
    alert_tx: Option<mpsc::Sender<AlertEvent>>,
}

impl PoolPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        fetch: Arc<FetchClient>,
        promotion: Arc<PromotionPolicy>,
        analytics: &AnalyticsSettings,
        scheduler: &SchedulerSettings,
    ) -> Self {
        Self {
            ingestor: Ingestor::new(store.clone(), analytics.max_gap_secs),
            store,
            fetch,
            il: IlEstimator::from_settings(analytics),
            alerts: AlertEvaluator::from_settings(analytics),
            promotion,
            sampling: analytics.sampling,
            initial_lookback: Duration::days(scheduler.initial_lookback_days),
            alert_tx: None,
        }
    }

    /// Send every fired alert on `tx` in addition to persisting it.
    pub fn with_alert_feed(mut self, tx: mpsc::Sender<AlertEvent>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    pub fn promotion(&self) -> &PromotionPolicy {
        &self.promotion
    }

    /// Refresh `pool` as of `now`.
    ///
    /// A failed price fetch or store error aborts the run and leaves the
    /// stored snapshot untouched. Missing metadata does not: market fields
    /// are carried over and the issue is recorded on the snapshot.
    pub async fn run(&self, pool: &Pool, now: DateTime<Utc>) -> Result<RunReport> {
        let key = pool.key();
        let mut report = RunReport::default();

        // ==================== FETCH & INGEST ====================

        let stats = self
            .store
            .observation_stats(&key)
            .await
            .with_context(|| format!("Failed to load observation stats of {}", key))?;
        let since = stats.newest.unwrap_or(now - self.initial_lookback);

        let samples = self
            .fetch
            .fetch_price_series(pool, since)
            .await
            .with_context(|| format!("Failed to fetch prices of {}", key))?;
        report.new_observations = self.ingestor.ingest(&key, &samples).await?;

        let (market, metadata_issue) = match self.fetch.fetch_pool_metadata(pool).await {
            Ok(metadata) => (metadata, None),
            Err(e) => {
                warn!("[Pipeline] {} metadata unavailable, carrying over: {}", key, e);
                let previous = self
                    .store
                    .get_snapshot(&key)
                    .await
                    .with_context(|| format!("Failed to load snapshot of {}", key))?;
                (
                    carried_metadata(previous.as_ref()),
                    Some(DataQualityIssue::MetadataUnavailable(e.to_string())),
                )
            },
        };

        // ==================== COMPUTE ====================

        let returns = self
            .store
            .recent_log_returns(&key, self.sampling.window_len(30))
            .await
            .with_context(|| format!("Failed to load log returns of {}", key))?;
        let volatility = VolatilitySet::compute(&returns, self.sampling);

        let stats = self.store.observation_stats(&key).await?;
        // Spot backends stamp samples at fetch time, which can be after `now`
        let as_of = stats.newest.map_or(now, |newest| newest.max(now));
        let mut snapshot = self.build_snapshot(pool, as_of, &market, &volatility, &stats);

        let insufficient = volatility.is_empty().then(|| DataQualityIssue::InsufficientSamples {
            available: returns.iter().flatten().count(),
            required: MIN_SAMPLES,
        });
        if let Some(issue) = insufficient.or(metadata_issue) {
            snapshot.last_error = Some(issue.to_string());
            snapshot.last_error_at = Some(now);
        }

        // ==================== PERSIST ====================

        report.snapshot_written = self
            .store
            .upsert_snapshot(&snapshot)
            .await
            .with_context(|| format!("Failed to store snapshot of {}", key))?;
        if !report.snapshot_written {
            debug!("[Pipeline] {} snapshot is older than the stored one, discarded", key);
            return Ok(report);
        }

        report.history_rows = self.record_history(&snapshot, &volatility, now).await?;
        report.alerts_fired = self.fire_alerts(&snapshot, now).await?;
        report.promoted = self.promotion.observe(&key, &volatility, now);

        debug!(
            "[Pipeline] {} refreshed: {} new observations, vol30d {:?}, fvr {:?}",
            key, report.new_observations, snapshot.volatility_30d, snapshot.fvr
        );
        Ok(report)
    }

    fn build_snapshot(
        &self,
        pool: &Pool,
        now: DateTime<Utc>,
        market: &PoolMetadata,
        volatility: &VolatilitySet,
        stats: &ObservationStats,
    ) -> PoolAnalyticsSnapshot {
        let fee_rate = pool.fee_rate();
        let mut snapshot = PoolAnalyticsSnapshot::new(pool.key(), now).with_stats(stats);

        snapshot.tvl_usd = market.tvl_usd;
        snapshot.volume_24h_usd = market.volume_24h_usd;
        snapshot.volume_7d_usd = market.volume_7d_usd;
        snapshot.fees_24h_usd = market.volume_24h_usd.map(|v| v * fee_rate);
        snapshot.fee_apr = fvr::fee_apr(
            market.fee_apr_pct,
            market.volume_24h_usd,
            fee_rate,
            market.tvl_usd,
        );

        snapshot.volatility_1d = volatility.d1;
        snapshot.volatility_7d = volatility.d7;
        snapshot.volatility_30d = volatility.d30;

        let Some(reference) = snapshot.reference_volatility() else {
            return snapshot;
        };

        if let Some(fee_apr) = snapshot.fee_apr {
            let ratio = fvr::fvr(fee_apr, reference);
            snapshot.fvr = Some(ratio);
            snapshot.recommendation = Some(Recommendation::classify(ratio));
        }

        if let Some(il) = self.il.expected_over_horizon(reference, pool.is_concentrated()) {
            snapshot.expected_il_30d = Some(il);
            snapshot.breakeven_fee_apr = Some(self.il.breakeven_fee_apr(il));
            snapshot.il_risk_score = Some(self.il.risk_score(il));
        }

        snapshot
    }

    /// Append today's history rows. The first computation of a day wins.
    async fn record_history(
        &self,
        snapshot: &PoolAnalyticsSnapshot,
        volatility: &VolatilitySet,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let date = now.date_naive();
        let mut inserted = 0;

        for (period_days, value) in volatility.windows() {
            let point = VolatilityHistoryPoint {
                pool: snapshot.pool.clone(),
                date,
                period_days,
                value,
            };
            if self.store.insert_volatility_history(&point).await? == HistoryWrite::Inserted {
                inserted += 1;
            }
        }

        if let (Some(ratio), Some(fee_apr), Some(vol), Some(recommendation)) = (
            snapshot.fvr,
            snapshot.fee_apr,
            snapshot.reference_volatility(),
            snapshot.recommendation,
        ) {
            let point = FvrHistoryPoint {
                pool: snapshot.pool.clone(),
                date,
                fvr: ratio,
                fee_apr,
                volatility: vol,
                recommendation,
            };
            if self.store.insert_fvr_history(&point).await? == HistoryWrite::Inserted {
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn fire_alerts(&self, snapshot: &PoolAnalyticsSnapshot, now: DateTime<Utc>) -> Result<usize> {
        let alerts = self
            .store
            .active_alerts(&snapshot.pool)
            .await
            .with_context(|| format!("Failed to load alerts of {}", snapshot.pool))?;
        let events = self.alerts.evaluate(&alerts, snapshot, now);

        for event in &events {
            self.store
                .mark_alert_triggered(event.alert_id, now)
                .await
                .with_context(|| format!("Failed to mark alert {} triggered", event.alert_id))?;

            info!(
                "[Alert] {} {} observed {:.4} against threshold {:.4}",
                event.pool, event.alert_type, event.observed_value, event.threshold_value
            );

            if let Some(tx) = &self.alert_tx {
                if tx.send(event.clone()).await.is_err() {
                    warn!("[Alert] feed closed, event {} not delivered", event.alert_id);
                }
            }
        }

        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AlertType;
    use crate::db::MemoryStore;
    use crate::scheduler::testing::{t0, HourlyFeed};

    fn pool() -> Pool {
        Pool::new("base", "0xpool", "0xa", "0xb", "WETH", "USDC", 500, "uniswap-v3")
    }

    fn pipeline(store: Arc<MemoryStore>, feed: &Arc<HourlyFeed>) -> PoolPipeline {
        PoolPipeline::new(
            store,
            HourlyFeed::client(feed),
            Arc::new(PromotionPolicy::default()),
            &AnalyticsSettings::default(),
            &SchedulerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_first_run_backfills_and_computes() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let report = pipeline(store.clone(), &feed).run(&pool(), t0()).await.unwrap();

        assert_eq!(report.new_observations, 30 * 24);
        assert!(report.snapshot_written);
        // three volatility windows plus one FVR point
        assert_eq!(report.history_rows, 4);

        let snapshot = store.get_snapshot(&pool().key()).await.unwrap().unwrap();
        assert_eq!(snapshot.last_updated, Some(t0()));
        assert_eq!(snapshot.data_points_count, 720);
        assert_eq!(snapshot.newest_data_point, Some(t0()));
        assert!(snapshot.volatility_1d.unwrap() > 0.0);
        assert!(snapshot.volatility_30d.unwrap() > 0.0);
        // 1M daily volume at 0.05% on 2M TVL
        assert!((snapshot.fee_apr.unwrap() - 0.09125).abs() < 1e-9);
        assert!((snapshot.fees_24h_usd.unwrap() - 500.0).abs() < 1e-9);
        assert!(snapshot.fvr.is_some());
        assert!(snapshot.recommendation.is_some());
        assert!(snapshot.expected_il_30d.unwrap() <= 0.0);
        assert!((1..=10).contains(&snapshot.il_risk_score.unwrap()));
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test]
    async fn test_next_run_fetches_only_new_samples() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let pipeline = pipeline(store.clone(), &feed);

        pipeline.run(&pool(), t0()).await.unwrap();
        feed.set_end(t0() + Duration::hours(2));
        let report = pipeline
            .run(&pool(), t0() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(report.new_observations, 2);
        assert_eq!(store.observation_count(&pool().key()), 722);
    }

    #[tokio::test]
    async fn test_history_written_once_per_day() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let pipeline = pipeline(store.clone(), &feed);

        pipeline.run(&pool(), t0()).await.unwrap();
        let again = pipeline
            .run(&pool(), t0() + Duration::hours(3))
            .await
            .unwrap();

        assert!(again.snapshot_written);
        assert_eq!(again.history_rows, 0);
        assert_eq!(store.volatility_history(&pool().key()).await.unwrap().len(), 3);
        assert_eq!(store.fvr_history(&pool().key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_outage_carries_market_fields() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let pipeline = pipeline(store.clone(), &feed);

        pipeline.run(&pool(), t0()).await.unwrap();
        feed.set_metadata_down(true);
        pipeline
            .run(&pool(), t0() + Duration::hours(1))
            .await
            .unwrap();

        let snapshot = store.get_snapshot(&pool().key()).await.unwrap().unwrap();
        assert_eq!(snapshot.last_updated, Some(t0() + Duration::hours(1)));
        assert_eq!(snapshot.tvl_usd, Some(2_000_000.0));
        assert!((snapshot.fee_apr.unwrap() - 0.09125).abs() < 1e-9);
        assert!(snapshot
            .last_error
            .unwrap()
            .contains("pool metadata unavailable"));
    }

    #[tokio::test]
    async fn test_insufficient_samples_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        // two samples give a single log return
        let feed = HourlyFeed::new(t0() - Duration::days(30) + Duration::hours(2));
        pipeline(store.clone(), &feed).run(&pool(), t0()).await.unwrap();

        let snapshot = store.get_snapshot(&pool().key()).await.unwrap().unwrap();
        assert_eq!(snapshot.volatility_1d, None);
        assert_eq!(snapshot.fvr, None);
        assert_eq!(snapshot.expected_il_30d, None);
        assert_eq!(snapshot.data_points_count, 2);
        assert!(snapshot.last_error.unwrap().contains("insufficient samples"));
    }

    #[tokio::test]
    async fn test_snapshot_covers_samples_stamped_after_tick() {
        let store = Arc::new(MemoryStore::new());
        let now = t0() + Duration::minutes(20);
        // the feed already has the candle closing after the tick started
        let feed = HourlyFeed::new(t0() + Duration::hours(1));
        let report = pipeline(store.clone(), &feed).run(&pool(), now).await.unwrap();

        assert!(report.snapshot_written);
        let snapshot = store.get_snapshot(&pool().key()).await.unwrap().unwrap();
        assert_eq!(snapshot.newest_data_point, Some(t0() + Duration::hours(1)));
        assert!(snapshot.last_updated >= snapshot.newest_data_point);

        let history = store.volatility_history(&pool().key()).await.unwrap();
        assert!(history.iter().all(|p| p.date == now.date_naive()));
    }

    #[tokio::test]
    async fn test_price_failure_leaves_snapshot_untouched() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        feed.fail_pool("0xpool");

        assert!(pipeline(store.clone(), &feed).run(&pool(), t0()).await.is_err());
        assert_eq!(store.get_snapshot(&pool().key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_run_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let pipeline = pipeline(store.clone(), &feed);

        pipeline
            .run(&pool(), t0() + Duration::hours(1))
            .await
            .unwrap();
        let stale = pipeline.run(&pool(), t0()).await.unwrap();

        assert!(!stale.snapshot_written);
        let snapshot = store.get_snapshot(&pool().key()).await.unwrap().unwrap();
        assert_eq!(snapshot.last_updated, Some(t0() + Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_alert_fires_once_per_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let feed = HourlyFeed::new(t0());
        let (tx, mut rx) = mpsc::channel(8);
        let pipeline = pipeline(store.clone(), &feed).with_alert_feed(tx);

        let alert_id = store
            .create_alert(&pool().key(), AlertType::VolatilitySpike, 0.0)
            .await
            .unwrap();

        assert_eq!(pipeline.run(&pool(), t0()).await.unwrap().alerts_fired, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.alert_id, alert_id);
        assert_eq!(event.triggered_at, t0());

        let later = pipeline
            .run(&pool(), t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(later.alerts_fired, 0);
        assert!(rx.try_recv().is_err());

        let alerts = store.active_alerts(&pool().key()).await.unwrap();
        assert_eq!(alerts[0].last_triggered, Some(t0()));
    }

    #[tokio::test]
    async fn test_volatility_spike_promotes_pool() {
        let store = Arc::new(MemoryStore::new());
        let spike_from = t0() - Duration::days(1);
        let feed = HourlyFeed::with_prices(t0(), move |at| {
            let swing = if at > spike_from { 0.2 } else { 0.001 };
            let sign = if at.timestamp() / 3600 % 2 == 0 { 1.0 } else { -1.0 };
            100.0 * (1.0 + swing * sign)
        });
        let pipeline = pipeline(store, &feed);

        let report = pipeline.run(&pool(), t0()).await.unwrap();

        assert!(report.promoted);
        assert_eq!(
            pipeline
                .promotion()
                .effective_tier(&pool().key(), crate::db::models::Tier::Screening, t0()),
            crate::db::models::Tier::Active
        );
    }
}
