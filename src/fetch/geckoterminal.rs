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
use crate::utils::{parse_decimal, validate_price_ratio, validate_usd_tvl, validate_usd_volume};

pub const SERVICE: &str = "geckoterminal";

/// Largest page the OHLCV endpoint serves.
const OHLCV_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
struct OhlcvResponse {
    data: OhlcvData,
}

#[derive(Debug, Deserialize)]
struct OhlcvData {
    attributes: OhlcvAttributes,
}

#[derive(Debug, Deserialize)]
struct OhlcvAttributes {
    /// `[timestamp, open, high, low, close, volume]`, newest first
    ohlcv_list: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    data: PoolData,
}

#[derive(Debug, Deserialize)]
struct PoolData {
    attributes: PoolAttributes,
}

#[derive(Debug, Deserialize)]
struct PoolAttributes {
    reserve_in_usd: Option<String>,
    #[serde(default)]
    volume_usd: HashMap<String, Option<String>>,
}

/// GeckoTerminal network slug for an engine network name.
fn network_id(network: &str) -> &str {
    match network {
        "ethereum" => "eth",
        "polygon" => "polygon_pos",
        "avalanche" => "avax",
        other => other,
    }
}

/// Hourly closes newer than `since`, oldest first. Malformed rows and
/// implausible prices are dropped.
fn samples_from_ohlcv(rows: &[Vec<f64>], since: DateTime<Utc>) -> Vec<RawSample> {
    let mut samples: Vec<RawSample> = rows
        .iter()
        .filter_map(|row| {
            let (ts, close) = (*row.first()?, *row.get(4)?);
            let timestamp = DateTime::from_timestamp(ts as i64, 0)?;
            if timestamp <= since {
                return None;
            }
            Some(RawSample {
                timestamp,
                price: validate_price_ratio(close)?,
                volume_usd: row.get(5).copied().and_then(validate_usd_volume),
            })
        })
        .collect();

    samples.sort_by_key(|s| s.timestamp);
    samples.dedup_by_key(|s| s.timestamp);
    samples
}

fn metadata_from_pool(attributes: &PoolAttributes) -> PoolMetadata {
    let volume = |window: &str| {
        attributes
            .volume_usd
            .get(window)
            .and_then(|v| v.as_deref())
            .and_then(parse_decimal)
            .and_then(validate_usd_volume)
    };

    PoolMetadata {
        tvl_usd: attributes
            .reserve_in_usd
            .as_deref()
            .and_then(parse_decimal)
            .and_then(validate_usd_tvl),
        volume_24h_usd: volume("h24"),
        volume_7d_usd: None,
        fee_apr_pct: None,
    }
}

/// GeckoTerminal public API: hourly OHLCV and pool state.
pub struct GeckoTerminalProvider {
    backend: HttpBackend,
}

impl GeckoTerminalProvider {
    pub fn new(settings: &ProviderSettings, limiters: Arc<RateLimiterSet>) -> anyhow::Result<Self> {
        Ok(Self {
            backend: HttpBackend::new(SERVICE, settings, None, limiters)?,
        })
    }
}

#[async_trait]
impl MarketDataProvider for GeckoTerminalProvider {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Pricing, Capability::Metadata]
    }

    async fn fetch_price_series(
        &self,
        pool: &Pool,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, ProviderError> {
        let path = format!(
            "networks/{}/pools/{}/ohlcv/hour",
            network_id(&pool.network),
            pool.address
        );
        let query = [
            ("aggregate", "1".to_string()),
            ("limit", OHLCV_LIMIT.to_string()),
            // token0 quoted in token1, the orientation every pricing backend uses
            ("currency", "token".to_string()),
            ("token", pool.token0.clone()),
        ];

        let response: OhlcvResponse = self.backend.get_json("ohlcv", &path, &query).await?;
        Ok(samples_from_ohlcv(&response.data.attributes.ohlcv_list, since))
    }

    async fn fetch_pool_metadata(&self, pool: &Pool) -> Result<PoolMetadata, ProviderError> {
        let path = format!(
            "networks/{}/pools/{}",
            network_id(&pool.network),
            pool.address
        );

        let response: PoolResponse = self.backend.get_json("pool", &path, &[]).await?;
        Ok(metadata_from_pool(&response.data.attributes))
    }
}
