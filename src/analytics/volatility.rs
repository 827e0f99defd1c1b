//! Rolling annualized volatility from log returns.
//!
//! Volatility is the population standard deviation of the trailing log
//! returns, scaled by `sqrt(samples_per_year)`. Fewer than two usable returns
//! is "insufficient data" and yields `None`, never zero.

use serde::{Deserialize, Serialize};

/// Windows maintained for every pool, in days.
pub const WINDOW_DAYS: [i16; 3] = [1, 7, 30];

/// Minimum number of returns for a meaningful standard deviation.
pub const MIN_SAMPLES: usize = 2;

/// Spacing of the stored price observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingFrequency {
    #[default]
    Hourly,
    Daily,
}

impl SamplingFrequency {
    pub fn samples_per_day(&self) -> usize {
        match self {
            SamplingFrequency::Hourly => 24,
            SamplingFrequency::Daily => 1,
        }
    }

    pub fn samples_per_year(&self) -> f64 {
        match self {
            SamplingFrequency::Hourly => 24.0 * 365.0,
            SamplingFrequency::Daily => 365.0,
        }
    }

    /// Number of trailing samples covering `window_days`.
    pub fn window_len(&self, window_days: i16) -> usize {
        window_days.max(0) as usize * self.samples_per_day()
    }
}

/// Population standard deviation, `None` below [`MIN_SAMPLES`].
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < MIN_SAMPLES {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some(variance.sqrt())
}

/// Annualized volatility of a return series.
pub fn annualized_volatility(returns: &[f64], sampling: SamplingFrequency) -> Option<f64> {
    population_std_dev(returns).map(|sd| sd * sampling.samples_per_year().sqrt())
}

/// Annualized volatility over the trailing `window_days`.
///
/// `log_returns` is chronological (newest last) and may contain `None` for
/// observations that had no valid predecessor; those are skipped, so a
/// window with continuity breaks simply has fewer samples.
pub fn trailing_volatility(
    log_returns: &[Option<f64>],
    window_days: i16,
    sampling: SamplingFrequency,
) -> Option<f64> {
    let len = sampling.window_len(window_days);
    let start = log_returns.len().saturating_sub(len);

    let returns: Vec<f64> = log_returns[start..]
        .iter()
        .flatten()
        .copied()
        .filter(|r| r.is_finite())
        .collect();

    annualized_volatility(&returns, sampling)
}

/// Volatility for each of the maintained windows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolatilitySet {
    pub d1: Option<f64>,
    pub d7: Option<f64>,
    pub d30: Option<f64>,
}

impl VolatilitySet {
    pub fn compute(log_returns: &[Option<f64>], sampling: SamplingFrequency) -> Self {
        Self {
            d1: trailing_volatility(log_returns, 1, sampling),
            d7: trailing_volatility(log_returns, 7, sampling),
            d30: trailing_volatility(log_returns, 30, sampling),
        }
    }

    /// (period_days, value) for every window that produced a value.
    pub fn windows(&self) -> Vec<(i16, f64)> {
        WINDOW_DAYS
            .iter()
            .zip([self.d1, self.d7, self.d30])
            .filter_map(|(days, value)| value.map(|v| (*days, v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.d1.is_none() && self.d7.is_none() && self.d30.is_none()
    }
}
