use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::ProviderSettings;
use crate::db::models::Pool;
use crate::error::ProviderError;
use crate::fetch::RateLimiterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Historical or spot price series.
    Pricing,
    /// TVL, volume and fee APR.
    Metadata,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Pricing => "pricing",
            Capability::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One price point as delivered by a provider, before ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume_usd: Option<f64>,
}

/// Market state of a pool. Every field is optional; providers fill what they
/// know.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMetadata {
    pub tvl_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub volume_7d_usd: Option<f64>,
    /// Fee APR in percent, as providers report it.
    pub fee_apr_pct: Option<f64>,
}

/// A market data backend.
///
/// Implementations acquire their own rate-limit permits so that cached
/// answers never consume quota.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Service name, also the key of its rate limit and provider settings.
    fn service(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Samples strictly newer than `since`, oldest first.
    async fn fetch_price_series(
        &self,
        pool: &Pool,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, ProviderError>;

    async fn fetch_pool_metadata(&self, pool: &Pool) -> Result<PoolMetadata, ProviderError>;
}

/// Map a non-success status to a provider error.
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<&HeaderValue>) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled {
            retry_after: retry_after
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::NOT_FOUND => ProviderError::NotFound,
        status => ProviderError::http(
            status.as_u16(),
            status.canonical_reason().unwrap_or("unexpected status"),
        ),
    }
}

/// Shared HTTP plumbing of the REST providers: base URL, optional API key
/// header, per-call timeout and rate-limit accounting.
pub struct HttpBackend {
    service: &'static str,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    limiters: Arc<RateLimiterSet>,
}

impl HttpBackend {
    pub fn new(
        service: &'static str,
        settings: &ProviderSettings,
        api_key_header: Option<&'static str>,
        limiters: Arc<RateLimiterSet>,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("Invalid base_url for {}: {}", service, settings.base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("base_url for {} must be http(s), got {}", service, base_url);
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let (Some(header), Some(key)) = (api_key_header, settings.api_key.as_deref()) {
            let value = HeaderValue::from_str(key)
                .with_context(|| format!("Invalid API key for {}", service))?;
            headers.insert(header, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout())
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", service))?;

        Ok(Self {
            service,
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            timeout: settings.timeout(),
            limiters,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and decode the JSON body.
    ///
    /// Waits for a rate-limit permit first; the timeout only covers the call
    /// itself. Calls the provider never accepted are refunded.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let permit = self.limiters.acquire(self.service, endpoint).await;
        let url = self.url(path);
        debug!("[{}] GET {}", self.service, url);

        let result = match tokio::time::timeout(self.timeout, self.send(&url, query)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        match &result {
            Err(e) if !e.was_accepted() => permit.refund().await,
            _ => permit.commit().await,
        }

        let text = result?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<String, ProviderError> {
        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(classify_status(
                status,
                response.headers().get(RETRY_AFTER),
            ));
        }

        Ok(response.text().await?)
    }
}
