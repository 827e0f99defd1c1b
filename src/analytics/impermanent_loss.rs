//! Impermanent loss (IL) estimation.
//!
//! Base formula is the constant-product loss versus holding:
//!
//! ```text
//! il(r) = 2 * sqrt(r) / (1 + r) - 1        r = price_now / price_entry
//! ```
//!
//! It is 0 at `r = 1`, negative elsewhere, and symmetric under `r <-> 1/r`.
//! Concentrated positions are approximated by scaling the full-range loss
//! with a fixed amplification factor. That factor is a coarse, tunable
//! policy value rather than something derived from the position's range.

use crate::config::AnalyticsSettings;

/// Loss never reaches -100%; amplified estimates are clamped just above it.
const MIN_IL: f64 = -1.0 + 1e-9;

const DAYS_PER_YEAR: f64 = 365.0;

/// Full-range constant-product IL, `None` for a non-positive or non-finite ratio.
pub fn constant_product_il(price_ratio: f64) -> Option<f64> {
    if !price_ratio.is_finite() || price_ratio <= 0.0 {
        return None;
    }
    let il = 2.0 * price_ratio.sqrt() / (1.0 + price_ratio) - 1.0;
    Some(il.min(0.0))
}

/// IL policy: amplification for concentrated positions, evaluation horizon
/// and the |IL| boundaries of the 1..10 risk score.
#[derive(Debug, Clone)]
pub struct IlEstimator {
    amplification: f64,
    horizon_days: f64,
    risk_thresholds: Vec<f64>,
}

impl IlEstimator {
    pub fn new(amplification: f64, horizon_days: f64, mut risk_thresholds: Vec<f64>) -> Self {
        risk_thresholds.retain(|t| t.is_finite());
        risk_thresholds.sort_by(f64::total_cmp);
        risk_thresholds.truncate(9);

        Self {
            amplification,
            horizon_days,
            risk_thresholds,
        }
    }

    pub fn from_settings(settings: &AnalyticsSettings) -> Self {
        Self::new(
            settings.il_amplification,
            settings.il_horizon_days,
            settings.risk_score_thresholds.clone(),
        )
    }

    pub fn horizon_years(&self) -> f64 {
        self.horizon_days / DAYS_PER_YEAR
    }

    /// Estimated IL in (-1, 0] for a price ratio.
    pub fn estimate(&self, price_ratio: f64, concentrated: bool) -> Option<f64> {
        let base = constant_product_il(price_ratio)?;
        if !concentrated {
            return Some(base);
        }
        Some((base * self.amplification).max(MIN_IL))
    }

    /// IL after a one-sigma price move over the horizon, given annualized
    /// volatility. The move is `exp(sigma * sqrt(horizon_years))`; by symmetry
    /// the down move gives the same loss.
    pub fn expected_over_horizon(&self, volatility: f64, concentrated: bool) -> Option<f64> {
        if !volatility.is_finite() || volatility < 0.0 {
            return None;
        }
        let ratio = (volatility * self.horizon_years().sqrt()).exp();
        self.estimate(ratio, concentrated)
    }

    /// Annualized fee yield that exactly offsets `il` over the horizon.
    pub fn breakeven_fee_apr(&self, il: f64) -> f64 {
        let years = self.horizon_years();
        if years <= 0.0 {
            return 0.0;
        }
        il.abs() / years
    }

    /// 1 + number of risk boundaries reached by |il|, clamped to 1..=10.
    pub fn risk_score(&self, il: f64) -> i16 {
        let magnitude = il.abs();
        let reached = self
            .risk_thresholds
            .iter()
            .take_while(|t| magnitude >= **t)
            .count() as i16;
        (1 + reached).clamp(1, 10)
    }
}

impl Default for IlEstimator {
    fn default() -> Self {
        Self::from_settings(&AnalyticsSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> IlEstimator {
        IlEstimator::default()
    }

    #[test]
    fn test_no_divergence_no_loss() {
        assert_eq!(estimator().estimate(1.0, false), Some(0.0));
        assert_eq!(estimator().estimate(1.0, true), Some(0.0));
    }

    #[test]
    fn test_invalid_ratio() {
        assert_eq!(constant_product_il(0.0), None);
        assert_eq!(constant_product_il(-2.0), None);
        assert_eq!(constant_product_il(f64::NAN), None);
        assert_eq!(constant_product_il(f64::INFINITY), None);
    }

    #[test]
    fn test_symmetry_under_inversion() {
        for r in [0.01, 0.25, 0.5, 0.9, 1.1, 1.5, 2.0, 4.0, 100.0] {
            let a = estimator().estimate(r, false).unwrap();
            let b = estimator().estimate(1.0 / r, false).unwrap();
            assert!((a - b).abs() < 1e-12, "r={r}: {a} vs {b}");
        }
    }

    #[test]
    fn test_concentrated_is_amplified() {
        for r in [0.5, 0.8, 1.2, 1.5, 3.0] {
            let full = estimator().estimate(r, false).unwrap();
            let conc = estimator().estimate(r, true).unwrap();
            assert!((conc - 1.5 * full).abs() < 1e-15);
        }
    }

    #[test]
    fn test_scenario_price_ratio_one_and_a_half() {
        let full = estimator().estimate(1.5, false).unwrap();
        let conc = estimator().estimate(1.5, true).unwrap();
        assert!((full - (2.0 * 1.5_f64.sqrt() / 2.5 - 1.0)).abs() < 1e-15);
        assert!((full + 0.0202).abs() < 1e-4);
        assert!((conc + 0.0303).abs() < 1e-4);
    }

    #[test]
    fn test_range_is_open_at_minus_one() {
        let e = estimator();
        for r in [1e-12, 1e12] {
            let full = e.estimate(r, false).unwrap();
            let conc = e.estimate(r, true).unwrap();
            assert!(full > -1.0 && full <= 0.0);
            assert!(conc > -1.0 && conc <= 0.0);
        }
    }

    #[test]
    fn test_breakeven_apr() {
        let e = IlEstimator::new(1.5, 30.0, vec![]);
        let apr = e.breakeven_fee_apr(-0.01);
        assert!((apr - 0.01 * 365.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_expected_il_grows_with_volatility() {
        let e = estimator();
        let calm = e.expected_over_horizon(0.2, true).unwrap();
        let wild = e.expected_over_horizon(1.2, true).unwrap();
        assert!(wild < calm);
        assert_eq!(e.expected_over_horizon(0.0, true), Some(0.0));
        assert_eq!(e.expected_over_horizon(-0.1, true), None);
    }

    #[test]
    fn test_risk_score_is_monotonic_and_clamped() {
        let e = estimator();
        assert_eq!(e.risk_score(0.0), 1);
        assert_eq!(e.risk_score(-0.5), 10);

        let mut last = 0;
        for i in 0..200 {
            let score = e.risk_score(-(i as f64) * 0.001);
            assert!((1..=10).contains(&score));
            assert!(score >= last);
            last = score;
        }
    }

    #[test]
    fn test_risk_thresholds_are_sorted() {
        let e = IlEstimator::new(1.5, 30.0, vec![0.05, 0.01]);
        assert_eq!(e.risk_score(0.02), 2);
        assert_eq!(e.risk_score(0.06), 3);
    }
}
