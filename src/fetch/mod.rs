//! Market data acquisition.
//!
//! - [`rate_limiter`] - per-service sliding-window quotas with usage accounting
//! - [`circuit`] - per-backend circuit breaking
//! - [`provider`] - the provider trait, its data types and shared HTTP plumbing
//! - [`geckoterminal`], [`defillama`], [`coingecko`] - concrete providers
//! - [`client`] - retry, backoff and failover across provider chains

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::config::Settings;

pub mod circuit;
pub mod client;
pub mod coingecko;
pub mod defillama;
pub mod geckoterminal;
pub mod provider;
pub mod rate_limiter;

pub use client::FetchClient;
pub use provider::{Capability, MarketDataProvider, PoolMetadata, RawSample};
pub use rate_limiter::{Permit, RateLimiterSet, ServiceLimiter};

/// Build every provider that has a `providers.<service>` section.
pub fn build_providers(
    settings: &Settings,
    limiters: Arc<RateLimiterSet>,
) -> anyhow::Result<Vec<Arc<dyn MarketDataProvider>>> {
    let mut providers: Vec<Arc<dyn MarketDataProvider>> = Vec::new();

    for (service, provider_settings) in &settings.providers {
        let provider: Arc<dyn MarketDataProvider> = match service.as_str() {
            geckoterminal::SERVICE => Arc::new(geckoterminal::GeckoTerminalProvider::new(
                provider_settings,
                limiters.clone(),
            )?),
            defillama::SERVICE => Arc::new(defillama::DefiLlamaProvider::new(
                provider_settings,
                Duration::from_secs(settings.fetch.metadata_cache_secs),
                limiters.clone(),
            )?),
            coingecko::SERVICE => Arc::new(coingecko::CoinGeckoProvider::new(
                provider_settings,
                limiters.clone(),
            )?),
            other => {
                warn!("[Fetch] Unknown provider '{}' in config, ignored", other);
                continue;
            },
        };

        if limiters.limiter(service).is_none() {
            warn!("[Fetch] No rate limit configured for {}", service);
        }
        providers.push(provider);
    }

    if providers.is_empty() {
        anyhow::bail!("No market data provider configured, check `providers` in config.yaml");
    }

    Ok(providers)
}
