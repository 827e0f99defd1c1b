//! Threshold alerts over freshly computed pool metrics.

use chrono::{DateTime, Duration, Utc};

use crate::config::AnalyticsSettings;
use crate::db::models::{Alert, AlertEvent, Breach, PoolAnalyticsSnapshot};

/// Compares active alerts against a snapshot, one trigger per alert per
/// cooldown interval.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    cooldown: Duration,
}

impl AlertEvaluator {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn from_settings(settings: &AnalyticsSettings) -> Self {
        Self::new(Duration::seconds(settings.alert_cooldown_secs))
    }

    pub fn is_breached(alert: &Alert, observed: f64) -> bool {
        match alert.alert_type.breach() {
            Breach::Above => observed > alert.threshold_value,
            Breach::Below => observed < alert.threshold_value,
        }
    }

    fn cooled_down(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        match alert.last_triggered {
            None => true,
            Some(last) => now - last >= self.cooldown,
        }
    }

    /// Alerts that fire for `snapshot` at `now`.
    ///
    /// Inactive alerts, alerts for other pools and alerts whose metric is not
    /// available yet never fire. The caller persists `last_triggered`.
    pub fn evaluate(
        &self,
        alerts: &[Alert],
        snapshot: &PoolAnalyticsSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        alerts
            .iter()
            .filter(|alert| alert.is_active && alert.pool == snapshot.pool)
            .filter_map(|alert| {
                let observed = alert.alert_type.observe(snapshot)?;
                if !Self::is_breached(alert, observed) || !self.cooled_down(alert, now) {
                    return None;
                }
                Some(AlertEvent {
                    alert_id: alert.id,
                    pool: alert.pool.clone(),
                    alert_type: alert.alert_type,
                    threshold_value: alert.threshold_value,
                    observed_value: observed,
                    triggered_at: now,
                })
            })
            .collect()
    }
}
