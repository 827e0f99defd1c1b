use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::analytics::volatility::SamplingFrequency;
use crate::db::models::Tier;

/// PostgreSQL database connection configuration.
///
/// Used for storing:
/// - Pool metadata and tracked position tiers
/// - Price observations (append-only)
/// - Analytics snapshots and their daily history
/// - API usage counters and alert definitions
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// Sliding-window quota for one external service.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Connection details for one market data provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    10
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry, failover and circuit-breaking policy of the fetch client.
#[derive(Debug, Deserialize, Clone)]
pub struct FetchSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Consecutive failed fetches before a backend is skipped
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    /// Ordered backends for price series, first is preferred
    #[serde(default = "default_pricing_chain")]
    pub pricing_chain: Vec<String>,
    /// Ordered backends for pool metadata (TVL, volume, fee APR)
    #[serde(default = "default_metadata_chain")]
    pub metadata_chain: Vec<String>,
    #[serde(default = "default_metadata_cache_secs")]
    pub metadata_cache_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_cooldown_secs() -> u64 {
    300
}

fn default_pricing_chain() -> Vec<String> {
    vec!["geckoterminal".to_string(), "coingecko".to_string()]
}

fn default_metadata_chain() -> Vec<String> {
    vec!["defillama".to_string(), "geckoterminal".to_string()]
}

fn default_metadata_cache_secs() -> u64 {
    3600
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            pricing_chain: default_pricing_chain(),
            metadata_chain: default_metadata_chain(),
            metadata_cache_secs: default_metadata_cache_secs(),
        }
    }
}

/// Tick driver configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Concurrent pool pipelines within one tick
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pools not started within this budget wait for the next tick
    #[serde(default = "default_tick_budget_secs")]
    pub tick_budget_secs: u64,
    /// Minimum delay before a pool whose last run failed is attempted again
    #[serde(default = "default_failure_retry_secs")]
    pub failure_retry_secs: u64,
    /// History requested for a pool with no observations yet
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: i64,
}

fn default_tick_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_workers() -> usize {
    4
}

fn default_tick_budget_secs() -> u64 {
    240
}

fn default_failure_retry_secs() -> u64 {
    900
}

fn default_initial_lookback_days() -> i64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_workers: default_max_workers(),
            tick_budget_secs: default_tick_budget_secs(),
            failure_retry_secs: default_failure_retry_secs(),
            initial_lookback_days: default_initial_lookback_days(),
        }
    }
}

/// Calculator policy values. None of these are physical constants; they are
/// product decisions exposed as configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsSettings {
    #[serde(default)]
    pub sampling: SamplingFrequency,
    /// Largest gap between consecutive observations that still yields a log return
    #[serde(default = "default_max_gap_secs")]
    pub max_gap_secs: i64,
    #[serde(default = "default_il_amplification")]
    pub il_amplification: f64,
    #[serde(default = "default_il_horizon_days")]
    pub il_horizon_days: f64,
    /// Ascending |IL| boundaries; a pool scores 1 + number of boundaries reached
    #[serde(default = "default_risk_score_thresholds")]
    pub risk_score_thresholds: Vec<f64>,
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: i64,
}

fn default_max_gap_secs() -> i64 {
    7200 // two hourly candles
}

fn default_il_amplification() -> f64 {
    1.5
}

fn default_il_horizon_days() -> f64 {
    30.0
}

fn default_risk_score_thresholds() -> Vec<f64> {
    vec![0.001, 0.0025, 0.005, 0.01, 0.02, 0.035, 0.05, 0.075, 0.10]
}

fn default_alert_cooldown_secs() -> i64 {
    3600
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            sampling: SamplingFrequency::default(),
            max_gap_secs: default_max_gap_secs(),
            il_amplification: default_il_amplification(),
            il_horizon_days: default_il_horizon_days(),
            risk_score_thresholds: default_risk_score_thresholds(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
        }
    }
}

/// Automatic promotion of spiking pools to the active tier.
#[derive(Debug, Deserialize, Clone)]
pub struct PromotionSettings {
    /// 1d volatility divided by the 30d baseline that counts as a spike
    #[serde(default = "default_spike_ratio")]
    pub spike_ratio: f64,
    /// Baselines below this are too quiet to compare against
    #[serde(default = "default_min_baseline")]
    pub min_baseline: f64,
    #[serde(default = "default_promotion_cooldown_secs")]
    pub cooldown_secs: i64,
}

fn default_spike_ratio() -> f64 {
    2.0
}

fn default_min_baseline() -> f64 {
    0.05
}

fn default_promotion_cooldown_secs() -> i64 {
    86_400
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            spike_ratio: default_spike_ratio(),
            min_baseline: default_min_baseline(),
            cooldown_secs: default_promotion_cooldown_secs(),
        }
    }
}

/// A pool seeded into `pools` and `user_positions` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackedPoolSettings {
    pub network: String,
    pub address: String,
    pub token0: String,
    pub token1: String,
    #[serde(default)]
    pub token0_symbol: String,
    #[serde(default)]
    pub token1_symbol: String,
    /// Fee in hundredths of a bip (3000 = 0.30%)
    pub fee_tier: u32,
    pub protocol: String,
    #[serde(default = "default_tier")]
    pub tier: Tier,
}

fn default_tier() -> Tier {
    Tier::Screening
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup, with `LPSCOPE__*` environment
/// variables layered on top (e.g. `LPSCOPE__POSTGRES__PASSWORD`).
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    pub rate_limits: HashMap<String, RateLimitSettings>,
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub analytics: AnalyticsSettings,
    #[serde(default)]
    pub promotion: PromotionSettings,
    #[serde(default)]
    pub tracked: Vec<TrackedPoolSettings>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .add_source(Environment::with_prefix("LPSCOPE").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
