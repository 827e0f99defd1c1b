//! Tiered refresh scheduling.
//!
//! - [`tier`] - cadences, due selection and spike promotion
//! - [`pipeline`] - the per-pool refresh
//! - [`scheduler`] - the tick driver

pub mod pipeline;
#[allow(clippy::module_inception)]
mod scheduler;
pub mod tier;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{PoolPipeline, RunReport};
pub use scheduler::{TickReport, TierScheduler};
pub use tier::{is_due, PromotionPolicy};
