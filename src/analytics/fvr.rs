//! Fee-to-volatility ratio (FVR).
//!
//! FVR compares what a pool pays LPs (fee APR) with the price risk they carry
//! (annualized volatility). Both inputs are fractions, so `0.12 / 0.30 = 0.4`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// FVR above this is attractive.
pub const ATTRACTIVE_ABOVE: f64 = 1.0;

/// FVR at or below this is overpriced.
pub const OVERPRICED_AT_OR_BELOW: f64 = 0.6;

/// `fee_apr / volatility`.
///
/// Zero volatility yields 0: a pool whose risk cannot be measured is treated
/// as unattractive rather than infinitely good.
pub fn fvr(fee_apr: f64, volatility: f64) -> f64 {
    if volatility == 0.0 || !volatility.is_finite() || !fee_apr.is_finite() {
        return 0.0;
    }
    fee_apr / volatility
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Attractive,
    Fair,
    Overpriced,
}

impl Recommendation {
    /// `> 1.0` attractive, `(0.6, 1.0]` fair, `<= 0.6` overpriced.
    pub fn classify(fvr: f64) -> Self {
        if fvr > ATTRACTIVE_ABOVE {
            Recommendation::Attractive
        } else if fvr > OVERPRICED_AT_OR_BELOW {
            Recommendation::Fair
        } else {
            Recommendation::Overpriced
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Attractive => "attractive",
            Recommendation::Fair => "fair",
            Recommendation::Overpriced => "overpriced",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recommendation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attractive" => Ok(Recommendation::Attractive),
            "fair" => Ok(Recommendation::Fair),
            "overpriced" => Ok(Recommendation::Overpriced),
            other => Err(anyhow::anyhow!("unknown recommendation '{}'", other)),
        }
    }
}

/// Fee APR as a fraction.
///
/// Prefers the provider's own figure (reported in percent). Otherwise
/// annualizes 24h fees over TVL. `None` without a positive TVL.
pub fn fee_apr(
    reported_apr_pct: Option<f64>,
    volume_24h_usd: Option<f64>,
    fee_rate: f64,
    tvl_usd: Option<f64>,
) -> Option<f64> {
    if let Some(pct) = reported_apr_pct.filter(|p| p.is_finite() && *p >= 0.0) {
        return Some(pct / 100.0);
    }

    let tvl = tvl_usd.filter(|t| *t > 0.0)?;
    let volume = volume_24h_usd.filter(|v| v.is_finite() && *v >= 0.0)?;
    Some(volume * fee_rate * 365.0 / tvl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_volatility_is_zero() {
        for fee in [0.0, 0.05, 1.0, 250.0] {
            assert_eq!(fvr(fee, 0.0), 0.0);
        }
    }

    #[test]
    fn test_scenario_overpriced() {
        let ratio = fvr(0.12, 0.30);
        assert!((ratio - 0.4).abs() < 1e-12);
        assert_eq!(Recommendation::classify(ratio), Recommendation::Overpriced);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(Recommendation::classify(1.0), Recommendation::Fair);
        assert_eq!(Recommendation::classify(0.6), Recommendation::Overpriced);
        assert_eq!(Recommendation::classify(1.0 + 1e-9), Recommendation::Attractive);
        assert_eq!(Recommendation::classify(0.6 + 1e-9), Recommendation::Fair);
        assert_eq!(Recommendation::classify(0.0), Recommendation::Overpriced);
        assert_eq!(Recommendation::classify(-1.0), Recommendation::Overpriced);
    }

    #[test]
    fn test_recommendation_text() {
        for rec in [
            Recommendation::Attractive,
            Recommendation::Fair,
            Recommendation::Overpriced,
        ] {
            assert_eq!(rec.to_string().parse::<Recommendation>().unwrap(), rec);
        }
    }

    #[test]
    fn test_fee_apr_prefers_reported_value() {
        let apr = fee_apr(Some(12.5), Some(1_000_000.0), 0.003, Some(10_000_000.0)).unwrap();
        assert!((apr - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_fee_apr_derived_from_volume() {
        // 1M daily volume at 0.3% on 10M TVL -> 3000 * 365 / 10M
        let apr = fee_apr(None, Some(1_000_000.0), 0.003, Some(10_000_000.0)).unwrap();
        assert!((apr - 0.1095).abs() < 1e-12);

        assert_eq!(fee_apr(None, Some(1_000_000.0), 0.003, Some(0.0)), None);
        assert_eq!(fee_apr(None, None, 0.003, Some(10.0)), None);
    }
}
