//! Utility functions for the collection engine.
//!
//! - [`validation`] - plausibility bounds for provider values
//! - [`time`] - time bucketing

mod time;
mod validation;

pub use time::hour_bucket;
pub use validation::{
    parse_decimal, validate_price_ratio, validate_usd_price, validate_usd_tvl,
    validate_usd_volume, MAX_PRICE_RATIO, MIN_PRICE_RATIO,
};
