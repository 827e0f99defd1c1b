//! Plausibility bounds for values coming from market data providers.
//!
//! These bounds catch unit and decimal errors while allowing legitimate
//! extremes:
//!
//! 1. PRICE RATIO: a pair can be as lopsided as BTC/SHIB (~7e9), but
//!    ratios beyond 1e12 usually mean a decimals mismatch.
//!
//! 2. TOKEN PRICE: no token costs $1M+ per unit.
//!
//! 3. VOLUME: daily volume above $100B for a single pool is an error.
//!
//! 4. TVL: no single pool holds $100B.

// ============================================
// Validation Constants
// ============================================

/// Maximum reasonable price ratio between two tokens (token0 in token1).
pub const MAX_PRICE_RATIO: f64 = 1e12;

/// Minimum reasonable price ratio. Inverse of MAX_PRICE_RATIO.
pub const MIN_PRICE_RATIO: f64 = 1e-12;

/// Maximum reasonable token price in USD.
pub const MAX_TOKEN_USD_PRICE: f64 = 1e6;

/// Maximum reasonable USD volume of one pool over a reporting window.
pub const MAX_VOLUME_USD: f64 = 1e11;

/// Maximum reasonable TVL in USD for a single pool.
pub const MAX_TVL_USD: f64 = 1e11;

// ============================================
// Validation Helpers
// ============================================

/// Validate a price ratio is within reasonable bounds.
#[inline]
pub fn validate_price_ratio(price: f64) -> Option<f64> {
    if price.is_finite() && (MIN_PRICE_RATIO..=MAX_PRICE_RATIO).contains(&price) {
        Some(price)
    } else {
        None
    }
}

/// Validate a token's USD price.
#[inline]
pub fn validate_usd_price(price: f64) -> Option<f64> {
    if price > 0.0 && price.is_finite() && price <= MAX_TOKEN_USD_PRICE {
        Some(price)
    } else {
        None
    }
}

/// Validate a USD volume. Zero is a valid volume.
#[inline]
pub fn validate_usd_volume(volume: f64) -> Option<f64> {
    if volume >= 0.0 && volume.is_finite() && volume <= MAX_VOLUME_USD {
        Some(volume)
    } else {
        None
    }
}

/// Validate a USD TVL. Zero is a valid (drained) TVL.
#[inline]
pub fn validate_usd_tvl(tvl: f64) -> Option<f64> {
    if tvl >= 0.0 && tvl.is_finite() && tvl <= MAX_TVL_USD {
        Some(tvl)
    } else {
        None
    }
}

/// Parse a decimal string as providers send it (`"163245123.4521"`).
#[inline]
pub fn parse_decimal(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
