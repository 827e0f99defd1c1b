//! Raw samples to price observations.
//!
//! Observations are unique per (pool, timestamp) and immutable once written:
//! re-ingesting a known timestamp is a no-op, even if the provider now
//! reports a different price. Each new observation carries the log return
//! against the observation immediately before it, or null when there is no
//! predecessor or the gap to it exceeds the tolerance.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::db::models::{PoolKey, PriceObservation};
use crate::db::Store;
use crate::fetch::RawSample;
use crate::utils::validate_price_ratio;

/// `ln(price / previous)` when both prices are usable.
pub fn log_return(previous: f64, price: f64) -> Option<f64> {
    let ratio = price / validate_price_ratio(previous)?;
    validate_price_ratio(price)?;
    let r = ratio.ln();
    r.is_finite().then_some(r)
}

/// Turn samples into new observations.
///
/// `known` holds the prices already stored around the batch (at least the
/// predecessor of the earliest sample). Timestamps present in `known` are
/// skipped. Every accepted sample is added to `known` so later samples in
/// the same batch chain onto it.
pub fn link_observations(
    pool: &PoolKey,
    known: &mut BTreeMap<DateTime<Utc>, f64>,
    samples: &[RawSample],
    max_gap: Duration,
) -> Vec<PriceObservation> {
    let mut sorted: Vec<&RawSample> = samples
        .iter()
        .filter(|s| validate_price_ratio(s.price).is_some())
        .collect();
    // Stable sort keeps the first of duplicate timestamps
    sorted.sort_by_key(|s| s.timestamp);

    let mut observations = Vec::with_capacity(sorted.len());
    for sample in sorted {
        if known.contains_key(&sample.timestamp) {
            continue;
        }

        let log_return = known
            .range(..sample.timestamp)
            .next_back()
            .filter(|(at, _)| sample.timestamp - **at <= max_gap)
            .and_then(|(_, previous)| log_return(*previous, sample.price));

        known.insert(sample.timestamp, sample.price);
        observations.push(PriceObservation {
            pool: pool.clone(),
            timestamp: sample.timestamp,
            price: sample.price,
            volume_usd: sample.volume_usd,
            log_return,
        });
    }

    observations
}

/// Writes provider samples into the observation store.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    max_gap: Duration,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, max_gap_secs: i64) -> Self {
        Self {
            store,
            max_gap: Duration::seconds(max_gap_secs),
        }
    }

    /// Ingest a batch. Returns the number of genuinely new observations.
    pub async fn ingest(&self, pool: &PoolKey, samples: &[RawSample]) -> Result<u64> {
        let (Some(first), Some(last)) = (
            samples.iter().map(|s| s.timestamp).min(),
            samples.iter().map(|s| s.timestamp).max(),
        ) else {
            return Ok(0);
        };

        let mut known: BTreeMap<DateTime<Utc>, f64> = self
            .store
            .observations_between(pool, first, last)
            .await
            .with_context(|| format!("Failed to load observations of {}", pool))?
            .into_iter()
            .map(|o| (o.timestamp, o.price))
            .collect();

        if let Some(previous) = self
            .store
            .latest_observation_before(pool, first)
            .await
            .with_context(|| format!("Failed to load predecessor observation of {}", pool))?
        {
            known.insert(previous.timestamp, previous.price);
        }

        let observations = link_observations(pool, &mut known, samples, self.max_gap);
        if observations.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .store
            .insert_observations(&observations)
            .await
            .with_context(|| format!("Failed to insert observations of {}", pool))?;

        debug!(
            "[Ingest] {}: {} samples, {} new observations",
            pool,
            samples.len(),
            inserted
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use chrono::TimeZone;

    fn key() -> PoolKey {
        PoolKey::new("ethereum", "0xpool")
    }

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn sample(hour: i64, price: f64) -> RawSample {
        RawSample {
            timestamp: at(hour),
            price,
            volume_usd: Some(1_000.0),
        }
    }

    fn ingestor(store: Arc<MemoryStore>) -> Ingestor {
        Ingestor::new(store, 7200)
    }

    #[test]
    fn test_log_return() {
        assert!((log_return(100.0, 110.0).unwrap() - (1.1_f64).ln()).abs() < 1e-12);
        assert_eq!(log_return(0.0, 110.0), None);
        assert_eq!(log_return(100.0, f64::NAN), None);
    }

    #[test]
    fn test_first_observation_has_no_return() {
        let mut known = BTreeMap::new();
        let obs = link_observations(
            &key(),
            &mut known,
            &[sample(1, 101.0), sample(0, 100.0)],
            Duration::hours(2),
        );

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].timestamp, at(0));
        assert_eq!(obs[0].log_return, None);
        assert!((obs[1].log_return.unwrap() - (1.01_f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_gap_beyond_tolerance_breaks_chain() {
        let mut known = BTreeMap::new();
        let obs = link_observations(
            &key(),
            &mut known,
            &[sample(0, 100.0), sample(2, 101.0), sample(5, 102.0)],
            Duration::hours(2),
        );

        assert!(obs[1].log_return.is_some());
        assert_eq!(obs[2].log_return, None);
    }

    #[test]
    fn test_duplicate_timestamps_in_batch_keep_first() {
        let mut known = BTreeMap::new();
        let obs = link_observations(
            &key(),
            &mut known,
            &[sample(0, 100.0), sample(0, 500.0), sample(1, 0.0)],
            Duration::hours(2),
        );

        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].price, 100.0);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store.clone());
        let batch = vec![sample(0, 100.0), sample(1, 101.0), sample(2, 99.0)];

        assert_eq!(ingestor.ingest(&key(), &batch).await.unwrap(), 3);
        let before = store.observations_between(&key(), at(0), at(2)).await.unwrap();

        let mut replay = batch.clone();
        replay[1].price = 250.0;
        assert_eq!(ingestor.ingest(&key(), &replay).await.unwrap(), 0);

        let after = store.observations_between(&key(), at(0), at(2)).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_next_batch_chains_onto_stored_predecessor() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store.clone());

        ingestor
            .ingest(&key(), &[sample(0, 100.0), sample(1, 100.0)])
            .await
            .unwrap();
        assert_eq!(
            ingestor
                .ingest(&key(), &[sample(1, 100.0), sample(2, 110.0)])
                .await
                .unwrap(),
            1
        );

        let stored = store.observations_between(&key(), at(2), at(2)).await.unwrap();
        assert!((stored[0].log_return.unwrap() - (1.1_f64).ln()).abs() < 1e-12);
        assert_eq!(store.observation_count(&key()), 3);
    }

    #[tokio::test]
    async fn test_backfill_links_to_preceding_observation() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store.clone());

        ingestor
            .ingest(&key(), &[sample(0, 100.0), sample(2, 104.0)])
            .await
            .unwrap();
        ingestor.ingest(&key(), &[sample(1, 102.0)]).await.unwrap();

        let stored = store.observations_between(&key(), at(0), at(2)).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!((stored[1].log_return.unwrap() - (1.02_f64).ln()).abs() < 1e-12);
        // Stored rows are never rewritten
        assert!((stored[2].log_return.unwrap() - (1.04_f64).ln()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = Arc::new(MemoryStore::new());
        assert_eq!(ingestor(store).ingest(&key(), &[]).await.unwrap(), 0);
    }
}
