//! Tier cadences, due-pool selection and temporary promotion.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::info;
use rustc_hash::FxHashMap;

use crate::analytics::VolatilitySet;
use crate::config::PromotionSettings;
use crate::db::models::{PoolKey, Tier, TrackedPool};

/// Whether `tracked` should run at `now` under `tier`.
///
/// A pool is due once its cadence elapsed since the last successful update
/// (or it was never updated). A failed attempt newer than that update holds
/// the pool back for `failure_retry` to protect provider quotas.
pub fn is_due(
    tracked: &TrackedPool,
    tier: Tier,
    now: DateTime<Utc>,
    failure_retry: Duration,
) -> bool {
    if let Some(failed_at) = tracked.last_error_at {
        let failed_since_update = tracked.last_updated.map_or(true, |u| failed_at > u);
        if failed_since_update && now - failed_at < failure_retry {
            return false;
        }
    }

    match tracked.last_updated {
        None => true,
        Some(updated) => now - updated >= tier.cadence(),
    }
}

/// Temporary promotion of pools with a volatility spike to [`Tier::Active`].
///
/// A spike is 1d volatility at least `spike_ratio` times the trailing
/// baseline (30d, else 7d), with the baseline above `min_baseline` so
/// near-zero baselines do not trigger. Promotion lasts until `cooldown` has
/// passed without another spike. State is in memory and resets on restart.
#[derive(Debug)]
pub struct PromotionPolicy {
    spike_ratio: f64,
    min_baseline: f64,
    cooldown: Duration,
    last_spike: Mutex<FxHashMap<PoolKey, DateTime<Utc>>>,
}

impl PromotionPolicy {
    pub fn new(spike_ratio: f64, min_baseline: f64, cooldown: Duration) -> Self {
        Self {
            spike_ratio,
            min_baseline,
            cooldown,
            last_spike: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn from_settings(settings: &PromotionSettings) -> Self {
        Self::new(
            settings.spike_ratio,
            settings.min_baseline,
            Duration::seconds(settings.cooldown_secs),
        )
    }

    pub fn is_spike(&self, volatility: &VolatilitySet) -> bool {
        let (Some(short), Some(baseline)) = (volatility.d1, volatility.d30.or(volatility.d7))
        else {
            return false;
        };
        baseline >= self.min_baseline && short / baseline >= self.spike_ratio
    }

    /// Record the latest volatility of a pool. Returns true when this starts
    /// a new promotion.
    pub fn observe(&self, key: &PoolKey, volatility: &VolatilitySet, now: DateTime<Utc>) -> bool {
        if !self.is_spike(volatility) {
            return false;
        }

        let mut spikes = self.last_spike.lock().unwrap_or_else(|e| e.into_inner());
        let was_promoted = spikes
            .get(key)
            .is_some_and(|last| now - *last < self.cooldown);
        spikes.insert(key.clone(), now);

        if !was_promoted {
            info!(
                "[Tier] {} promoted to active (1d vol {:.3} vs baseline {:.3})",
                key,
                volatility.d1.unwrap_or_default(),
                volatility.d30.or(volatility.d7).unwrap_or_default()
            );
        }
        !was_promoted
    }

    /// Tier a pool runs under at `now`: its assigned tier, or active while a
    /// promotion lasts.
    pub fn effective_tier(&self, key: &PoolKey, assigned: Tier, now: DateTime<Utc>) -> Tier {
        let mut spikes = self.last_spike.lock().unwrap_or_else(|e| e.into_inner());
        match spikes.get(key) {
            Some(last) if now - *last < self.cooldown => Tier::Active,
            Some(_) => {
                spikes.remove(key);
                info!("[Tier] {} promotion expired, back to {}", key, assigned);
                assigned
            },
            None => assigned,
        }
    }
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self::from_settings(&PromotionSettings::default())
    }
}
