//! Pure analytics over stored observations.
//!
//! - [`ingestion`] - samples to observations with log returns
//! - [`volatility`] - rolling annualized volatility
//! - [`fvr`] - fee-to-volatility ratio and recommendation
//! - [`impermanent_loss`] - IL estimation and risk scoring
//! - [`alerts`] - threshold alert evaluation

pub mod alerts;
pub mod fvr;
pub mod impermanent_loss;
pub mod ingestion;
pub mod volatility;

pub use alerts::AlertEvaluator;
pub use fvr::Recommendation;
pub use impermanent_loss::IlEstimator;
pub use ingestion::Ingestor;
pub use volatility::{SamplingFrequency, VolatilitySet};
