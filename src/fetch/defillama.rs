use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use moka::future::Cache;
use serde::Deserialize;

use crate::config::ProviderSettings;
use crate::db::models::Pool;
use crate::error::ProviderError;
use crate::fetch::provider::{Capability, HttpBackend, MarketDataProvider, PoolMetadata, RawSample};
use crate::fetch::RateLimiterSet;
use crate::utils::{validate_usd_tvl, validate_usd_volume};

pub const SERVICE: &str = "defillama";

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    data: Vec<LlamaPool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlamaPool {
    chain: String,
    project: String,
    /// UUID for most projects, `<address>-<chain>` for some
    pool: String,
    #[serde(default)]
    pool_meta: Option<String>,
    #[serde(default)]
    underlying_tokens: Option<Vec<String>>,
    tvl_usd: Option<f64>,
    apy_base: Option<f64>,
    volume_usd1d: Option<f64>,
    volume_usd7d: Option<f64>,
}

impl LlamaPool {
    fn on_network(&self, network: &str) -> bool {
        let chain = self.chain.to_lowercase();
        chain == network || (chain == "binance" && network == "bsc")
    }

    /// `"0.05%"` against fee tier 500.
    fn fee_matches(&self, fee_tier: u32) -> bool {
        self.pool_meta
            .as_deref()
            .and_then(|m| m.trim().trim_end_matches('%').parse::<f64>().ok())
            .map(|pct| (pct * 10_000.0 - fee_tier as f64).abs() < 0.5)
            .unwrap_or(false)
    }

    fn same_tokens(&self, pool: &Pool) -> bool {
        let Some(tokens) = &self.underlying_tokens else {
            return false;
        };
        let mut tokens: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        tokens.sort();
        let mut wanted = vec![pool.token0.clone(), pool.token1.clone()];
        wanted.sort();
        tokens == wanted
    }

    fn metadata(&self) -> PoolMetadata {
        PoolMetadata {
            tvl_usd: self.tvl_usd.and_then(validate_usd_tvl),
            volume_24h_usd: self.volume_usd1d.and_then(validate_usd_volume),
            volume_7d_usd: self.volume_usd7d.and_then(validate_usd_volume),
            fee_apr_pct: self.apy_base.filter(|apy| apy.is_finite() && *apy >= 0.0),
        }
    }
}

/// Locate a pool in the yields listing.
///
/// Listings that embed the address in their id win. Otherwise the project,
/// the token pair and the fee tier must all agree.
fn find_pool<'a>(pools: &'a [LlamaPool], pool: &Pool) -> Option<&'a LlamaPool> {
    let candidates = || pools.iter().filter(|p| p.on_network(&pool.network));

    candidates()
        .find(|p| p.pool.to_lowercase().contains(&pool.address))
        .or_else(|| {
            candidates().find(|p| {
                p.project.eq_ignore_ascii_case(&pool.protocol)
                    && p.same_tokens(pool)
                    && p.fee_matches(pool.fee_tier)
            })
        })
}

/// DefiLlama yields API. Serves every pool in one listing, so the listing
/// is cached and shared across pools.
pub struct DefiLlamaProvider {
    backend: HttpBackend,
    listing: Cache<(), Arc<Vec<LlamaPool>>>,
}

impl DefiLlamaProvider {
    pub fn new(
        settings: &ProviderSettings,
        cache_ttl: Duration,
        limiters: Arc<RateLimiterSet>,
    ) -> anyhow::Result<Self> {
        let listing = Cache::builder()
            .max_capacity(1)
            .time_to_live(cache_ttl)
            .build();

        Ok(Self {
            backend: HttpBackend::new(SERVICE, settings, None, limiters)?,
            listing,
        })
    }

    async fn listing(&self) -> Result<Arc<Vec<LlamaPool>>, ProviderError> {
        self.listing
            .try_get_with((), async {
                let response: PoolsResponse = self.backend.get_json("pools", "pools", &[]).await?;
                info!("[{}] Cached yields listing ({} pools)", SERVICE, response.data.len());
                Ok::<_, ProviderError>(Arc::new(response.data))
            })
            .await
            .map_err(|e| (*e).clone())
    }
}

#[async_trait]
impl MarketDataProvider for DefiLlamaProvider {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Metadata]
    }

    async fn fetch_price_series(
        &self,
        _pool: &Pool,
        _since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, ProviderError> {
        Err(ProviderError::Unsupported {
            service: SERVICE,
            capability: Capability::Pricing,
        })
    }

    async fn fetch_pool_metadata(&self, pool: &Pool) -> Result<PoolMetadata, ProviderError> {
        let listing = self.listing().await?;
        find_pool(&listing, pool)
            .map(LlamaPool::metadata)
            .ok_or(ProviderError::NotFound)
    }
}
