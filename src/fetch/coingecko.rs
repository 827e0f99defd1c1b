use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::ProviderSettings;
use crate::db::models::Pool;
use crate::error::ProviderError;
use crate::fetch::provider::{Capability, HttpBackend, MarketDataProvider, PoolMetadata, RawSample};
use crate::fetch::RateLimiterSet;
use crate::utils::{validate_price_ratio, validate_usd_price};

pub const SERVICE: &str = "coingecko";

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: Option<f64>,
}

/// CoinGecko asset platform id for an engine network name.
fn platform_id(network: &str) -> Option<&'static str> {
    match network {
        "ethereum" => Some("ethereum"),
        "arbitrum" => Some("arbitrum-one"),
        "base" => Some("base"),
        "polygon" => Some("polygon-pos"),
        "optimism" => Some("optimistic-ethereum"),
        "bsc" => Some("binance-smart-chain"),
        "avalanche" => Some("avalanche"),
        _ => None,
    }
}

/// token0 priced in token1 from two USD quotes.
fn pool_price(quotes: &HashMap<String, UsdQuote>, pool: &Pool) -> Option<f64> {
    let usd = |token: &str| {
        quotes
            .get(token)
            .and_then(|q| q.usd)
            .and_then(validate_usd_price)
    };
    validate_price_ratio(usd(&pool.token0)? / usd(&pool.token1)?)
}

/// CoinGecko spot prices. Fallback pricing only: one sample at call time.
pub struct CoinGeckoProvider {
    backend: HttpBackend,
}

impl CoinGeckoProvider {
    pub fn new(settings: &ProviderSettings, limiters: Arc<RateLimiterSet>) -> anyhow::Result<Self> {
        let key_header = if settings.base_url.contains("pro-api") {
            "x-cg-pro-api-key"
        } else {
            "x-cg-demo-api-key"
        };

        Ok(Self {
            backend: HttpBackend::new(SERVICE, settings, Some(key_header), limiters)?,
        })
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoProvider {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Pricing]
    }

    async fn fetch_price_series(
        &self,
        pool: &Pool,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, ProviderError> {
        let platform = platform_id(&pool.network).ok_or(ProviderError::NotFound)?;
        let path = format!("simple/token_price/{}", platform);
        let query = [
            (
                "contract_addresses",
                format!("{},{}", pool.token0, pool.token1),
            ),
            ("vs_currencies", "usd".to_string()),
        ];

        let quotes: HashMap<String, UsdQuote> =
            self.backend.get_json("token_price", &path, &query).await?;
        let quotes: HashMap<String, UsdQuote> = quotes
            .into_iter()
            .map(|(address, quote)| (address.to_lowercase(), quote))
            .collect();

        let price = pool_price(&quotes, pool).ok_or(ProviderError::NotFound)?;
        let timestamp = Utc::now();
        if timestamp <= since {
            return Ok(vec![]);
        }

        Ok(vec![RawSample {
            timestamp,
            price,
            volume_usd: None,
        }])
    }

    async fn fetch_pool_metadata(&self, _pool: &Pool) -> Result<PoolMetadata, ProviderError> {
        Err(ProviderError::Unsupported {
            service: SERVICE,
            capability: Capability::Metadata,
        })
    }
}
