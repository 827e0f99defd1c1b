use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{PoolAnalyticsSnapshot, PoolKey};

/// Which side of the threshold counts as a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Above,
    Below,
}

/// Metric an alert watches. The direction is implied by the type:
/// spike-type alerts fire when the metric exceeds the threshold,
/// risk-type alerts when it falls below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// 1d annualized volatility exceeds threshold
    VolatilitySpike,
    /// |expected 30d IL| exceeds threshold
    IlRisk,
    /// FVR falls below threshold
    FvrDrop,
    /// TVL (USD) falls below threshold
    TvlDrop,
}

impl AlertType {
    pub fn breach(&self) -> Breach {
        match self {
            AlertType::VolatilitySpike | AlertType::IlRisk => Breach::Above,
            AlertType::FvrDrop | AlertType::TvlDrop => Breach::Below,
        }
    }

    /// Current value of the watched metric, if the snapshot has one.
    pub fn observe(&self, snapshot: &PoolAnalyticsSnapshot) -> Option<f64> {
        match self {
            AlertType::VolatilitySpike => snapshot.volatility_1d,
            AlertType::IlRisk => snapshot.expected_il_30d.map(f64::abs),
            AlertType::FvrDrop => snapshot.fvr,
            AlertType::TvlDrop => snapshot.tvl_usd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::VolatilitySpike => "volatility_spike",
            AlertType::IlRisk => "il_risk",
            AlertType::FvrDrop => "fvr_drop",
            AlertType::TvlDrop => "tvl_drop",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volatility_spike" => Ok(AlertType::VolatilitySpike),
            "il_risk" => Ok(AlertType::IlRisk),
            "fvr_drop" => Ok(AlertType::FvrDrop),
            "tvl_drop" => Ok(AlertType::TvlDrop),
            other => Err(anyhow::anyhow!("unknown alert type '{}'", other)),
        }
    }
}

/// Threshold alert definition (PostgreSQL `alerts`).
///
/// Created and toggled by external configuration; the evaluator only ever
/// writes `last_triggered`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    pub pool: PoolKey,
    pub alert_type: AlertType,
    pub threshold_value: f64,
    pub is_active: bool,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Emitted on the alert feed when an alert fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub alert_id: i64,
    pub pool: PoolKey,
    pub alert_type: AlertType,
    pub threshold_value: f64,
    pub observed_value: f64,
    pub triggered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_type_round_trips_through_text() {
        for alert_type in [
            AlertType::VolatilitySpike,
            AlertType::IlRisk,
            AlertType::FvrDrop,
            AlertType::TvlDrop,
        ] {
            assert_eq!(alert_type.as_str().parse::<AlertType>().unwrap(), alert_type);
        }
        assert!("price_moon".parse::<AlertType>().is_err());
    }

    #[test]
    fn test_il_risk_observes_magnitude() {
        let snapshot = PoolAnalyticsSnapshot {
            expected_il_30d: Some(-0.04),
            ..Default::default()
        };
        assert_eq!(AlertType::IlRisk.observe(&snapshot), Some(0.04));
        assert_eq!(AlertType::FvrDrop.observe(&snapshot), None);
    }
}
