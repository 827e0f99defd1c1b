use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::config::FetchSettings;
use crate::db::models::Pool;
use crate::error::{FetchError, ProviderError};
use crate::fetch::circuit::CircuitBreaker;
use crate::fetch::provider::{Capability, MarketDataProvider, PoolMetadata, RawSample};

/// Upper bound for a single backoff, including provider `Retry-After`.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Backend {
    provider: Arc<dyn MarketDataProvider>,
    circuit: CircuitBreaker,
}

/// Fetches pool data through ordered chains of capability-equivalent
/// backends.
///
/// Each backend is retried with exponential backoff on transient failures,
/// then the next backend in the chain is tried. Backends that keep failing
/// are skipped while their circuit is open.
pub struct FetchClient {
    pricing: Vec<Arc<Backend>>,
    metadata: Vec<Arc<Backend>>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl FetchClient {
    pub fn new(providers: Vec<Arc<dyn MarketDataProvider>>, settings: &FetchSettings) -> Self {
        let cooldown = Duration::from_secs(settings.circuit_cooldown_secs);
        let backends: FxHashMap<&'static str, Arc<Backend>> = providers
            .into_iter()
            .map(|provider| {
                let service = provider.service();
                let circuit =
                    CircuitBreaker::new(service, settings.circuit_failure_threshold, cooldown);
                (service, Arc::new(Backend { provider, circuit }))
            })
            .collect();

        let chain = |names: &[String], capability: Capability| -> Vec<Arc<Backend>> {
            names
                .iter()
                .filter_map(|name| match backends.get(name.as_str()) {
                    Some(b) if b.provider.supports(capability) => Some(b.clone()),
                    Some(_) => {
                        warn!("[Fetch] {} does not provide {}, skipped", name, capability);
                        None
                    },
                    None => {
                        warn!("[Fetch] {} chain names unknown provider {}", capability, name);
                        None
                    },
                })
                .collect()
        };

        let pricing = chain(&settings.pricing_chain, Capability::Pricing);
        let metadata = chain(&settings.metadata_chain, Capability::Metadata);

        info!(
            "[Fetch] pricing chain: [{}], metadata chain: [{}]",
            pricing
                .iter()
                .map(|b| b.provider.service())
                .collect::<Vec<_>>()
                .join(", "),
            metadata
                .iter()
                .map(|b| b.provider.service())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            pricing,
            metadata,
            max_attempts: settings.max_attempts.max(1),
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
        }
    }

    /// Samples newer than `since`, oldest first.
    pub async fn fetch_price_series(
        &self,
        pool: &Pool,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, FetchError> {
        self.with_failover(Capability::Pricing, pool, |p| {
            p.fetch_price_series(pool, since)
        })
        .await
    }

    pub async fn fetch_pool_metadata(&self, pool: &Pool) -> Result<PoolMetadata, FetchError> {
        self.with_failover(Capability::Metadata, pool, |p| p.fetch_pool_metadata(pool))
            .await
    }

    fn chain(&self, capability: Capability) -> &[Arc<Backend>] {
        match capability {
            Capability::Pricing => &self.pricing,
            Capability::Metadata => &self.metadata,
        }
    }

    fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        let exponential = self.base_backoff.saturating_mul(2_u32.saturating_pow(attempt));
        let delay = match error {
            ProviderError::Throttled {
                retry_after: Some(retry_after),
            } => exponential.max(*retry_after),
            _ => exponential,
        };
        delay.min(MAX_BACKOFF)
    }

    async fn with_failover<'a, T, F>(
        &'a self,
        capability: Capability,
        pool: &'a Pool,
        call: F,
    ) -> Result<T, FetchError>
    where
        F: Fn(&'a dyn MarketDataProvider) -> BoxFuture<'a, Result<T, ProviderError>>,
    {
        let mut reasons = Vec::new();

        for backend in self.chain(capability) {
            let service = backend.provider.service();

            if !backend.circuit.allows_request() {
                debug!("[Fetch] {} circuit open, skipping for {}", service, pool.key());
                reasons.push(format!("{}: circuit open", service));
                continue;
            }

            let mut last_error = None;
            for attempt in 0..self.max_attempts {
                match call(backend.provider.as_ref()).await {
                    Ok(value) => {
                        backend.circuit.record_success();
                        return Ok(value);
                    },
                    Err(e) if !e.is_retryable() => {
                        debug!("[Fetch] {} {} for {}: {}", service, capability, pool.key(), e);
                        last_error = Some(e);
                        break;
                    },
                    Err(e) => {
                        if attempt + 1 < self.max_attempts {
                            let delay = self.backoff(attempt, &e);
                            warn!(
                                "[Fetch] {} {} for {}: {} (attempt {}/{}), retrying in {:?}",
                                service,
                                capability,
                                pool.key(),
                                e,
                                attempt + 1,
                                self.max_attempts,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        last_error = Some(e);
                    },
                }
            }

            if let Some(e) = last_error {
                if e.counts_against_backend() {
                    backend.circuit.record_failure();
                } else {
                    backend.circuit.release_probe();
                }
                let failure = FetchError::from_provider(service, e);
                warn!("[Fetch] {} gave up on {}: {}", capability, pool.key(), failure);
                reasons.push(failure.to_string());
            }
        }

        if reasons.is_empty() {
            reasons.push(format!("no {} backend configured", capability));
        }

        Err(FetchError::DataUnavailable {
            pool: pool.key().to_string(),
            capability,
            reasons: reasons.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes, then keeps returning the last one.
    struct Scripted {
        service: &'static str,
        capabilities: &'static [Capability],
        script: Mutex<VecDeque<Result<f64, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(
            service: &'static str,
            script: Vec<Result<f64, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                service,
                capabilities: &[Capability::Pricing, Capability::Metadata],
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn next(&self) -> Result<f64, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataProvider for Scripted {
        fn service(&self) -> &'static str {
            self.service
        }

        fn capabilities(&self) -> &'static [Capability] {
            self.capabilities
        }

        async fn fetch_price_series(
            &self,
            _pool: &Pool,
            since: DateTime<Utc>,
        ) -> Result<Vec<RawSample>, ProviderError> {
            let price = self.next()?;
            Ok(vec![RawSample {
                timestamp: since + chrono::Duration::hours(1),
                price,
                volume_usd: None,
            }])
        }

        async fn fetch_pool_metadata(&self, _pool: &Pool) -> Result<PoolMetadata, ProviderError> {
            let tvl = self.next()?;
            Ok(PoolMetadata {
                tvl_usd: Some(tvl),
                ..Default::default()
            })
        }
    }

    fn settings(chain: &[&str]) -> FetchSettings {
        FetchSettings {
            max_attempts: 3,
            base_backoff_ms: 500,
            circuit_failure_threshold: 2,
            circuit_cooldown_secs: 300,
            pricing_chain: chain.iter().map(|s| s.to_string()).collect(),
            metadata_chain: chain.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn pool() -> Pool {
        Pool::new("ethereum", "0xpool", "0xa", "0xb", "A", "B", 500, "uniswap-v3")
    }

    fn client(providers: &[Arc<Scripted>], chain: &[&str]) -> FetchClient {
        let providers = providers
            .iter()
            .map(|p| p.clone() as Arc<dyn MarketDataProvider>)
            .collect();
        FetchClient::new(providers, &settings(chain))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::Timeout), Ok(2.5)]);
        let client = client(&[primary.clone()], &["primary"]);

        let samples = client
            .fetch_price_series(&pool(), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples[0].price, 2.5);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_retries_exhausted() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::http(503, "down"))]);
        let fallback = Scripted::new("fallback", vec![Ok(1_000.0)]);
        let client = client(&[primary.clone(), fallback.clone()], &["primary", "fallback"]);

        let metadata = client.fetch_pool_metadata(&pool()).await.unwrap();
        assert_eq!(metadata.tvl_usd, Some(1_000.0));
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_moves_on_without_retry() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::NotFound)]);
        let fallback = Scripted::new("fallback", vec![Ok(3.0)]);
        let client = client(&[primary.clone(), fallback.clone()], &["primary", "fallback"]);

        client
            .fetch_price_series(&pool(), Utc::now())
            .await
            .unwrap();
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_is_data_unavailable() {
        let primary = Scripted::new(
            "primary",
            vec![Err(ProviderError::Throttled { retry_after: None })],
        );
        let fallback = Scripted::new("fallback", vec![Err(ProviderError::Timeout)]);
        let client = client(&[primary, fallback], &["primary", "fallback"]);

        let err = client
            .fetch_price_series(&pool(), Utc::now())
            .await
            .unwrap_err();
        match err {
            FetchError::DataUnavailable {
                capability,
                reasons,
                ..
            } => {
                assert_eq!(capability, Capability::Pricing);
                assert!(reasons.contains("primary: quota exceeded"));
                assert!(reasons.contains("fallback: request timed out"));
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_backend() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::Timeout)]);
        let fallback = Scripted::new("fallback", vec![Ok(4.0)]);
        let client = client(&[primary.clone(), fallback.clone()], &["primary", "fallback"]);

        // threshold 2: two exhausted fetches open the circuit
        for _ in 0..2 {
            client
                .fetch_price_series(&pool(), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(primary.calls(), 6);

        client
            .fetch_price_series(&pool(), Utc::now())
            .await
            .unwrap();
        assert_eq!(primary.calls(), 6);
        assert_eq!(fallback.calls(), 3);
    }

    #[test]
    fn test_backoff_doubles_and_honours_retry_after() {
        let client = client(&[], &[]);

        assert_eq!(
            client.backoff(0, &ProviderError::Timeout),
            Duration::from_millis(500)
        );
        assert_eq!(
            client.backoff(2, &ProviderError::Timeout),
            Duration::from_millis(2000)
        );
        assert_eq!(
            client.backoff(
                0,
                &ProviderError::Throttled {
                    retry_after: Some(Duration::from_secs(20))
                }
            ),
            Duration::from_secs(20)
        );
        assert_eq!(client.backoff(20, &ProviderError::Timeout), MAX_BACKOFF);
    }
}
