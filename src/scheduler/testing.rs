//! Deterministic market feed for pipeline and scheduler tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rustc_hash::FxHashSet;

use crate::config::FetchSettings;
use crate::db::models::Pool;
use crate::error::ProviderError;
use crate::fetch::{Capability, FetchClient, MarketDataProvider, PoolMetadata, RawSample};
use crate::utils::hour_bucket;

pub const FEED: &str = "feed";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

type PriceFn = Box<dyn Fn(DateTime<Utc>) -> f64 + Send + Sync>;

/// Serves one hourly close per hour up to `end` and fixed metadata.
pub struct HourlyFeed {
    end: Mutex<DateTime<Utc>>,
    price: PriceFn,
    failing: Mutex<FxHashSet<String>>,
    metadata_down: AtomicBool,
    price_calls: AtomicUsize,
}

impl HourlyFeed {
    pub fn new(end: DateTime<Utc>) -> Arc<Self> {
        Self::with_prices(end, |at| {
            let h = at.timestamp() as f64 / 3600.0;
            100.0 * (1.0 + 0.01 * h.sin())
        })
    }

    pub fn with_prices(
        end: DateTime<Utc>,
        price: impl Fn(DateTime<Utc>) -> f64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            end: Mutex::new(end),
            price: Box::new(price),
            failing: Mutex::new(FxHashSet::default()),
            metadata_down: AtomicBool::new(false),
            price_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_end(&self, end: DateTime<Utc>) {
        *self.end.lock().unwrap() = end;
    }

    pub fn fail_pool(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn set_metadata_down(&self, down: bool) {
        self.metadata_down.store(down, Ordering::SeqCst);
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    pub fn client(feed: &Arc<Self>) -> Arc<FetchClient> {
        let settings = FetchSettings {
            pricing_chain: vec![FEED.to_string()],
            metadata_chain: vec![FEED.to_string()],
            ..Default::default()
        };
        Arc::new(FetchClient::new(
            vec![feed.clone() as Arc<dyn MarketDataProvider>],
            &settings,
        ))
    }
}

#[async_trait]
impl MarketDataProvider for HourlyFeed {
    fn service(&self) -> &'static str {
        FEED
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Pricing, Capability::Metadata]
    }

    async fn fetch_price_series(
        &self,
        pool: &Pool,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, ProviderError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&pool.address) {
            return Err(ProviderError::NotFound);
        }

        let end = *self.end.lock().unwrap();
        let mut at = hour_bucket(since) + Duration::hours(1);
        let mut samples = Vec::new();
        while at <= end {
            samples.push(RawSample {
                timestamp: at,
                price: (self.price)(at),
                volume_usd: Some(50_000.0),
            });
            at += Duration::hours(1);
        }
        Ok(samples)
    }

    async fn fetch_pool_metadata(&self, pool: &Pool) -> Result<PoolMetadata, ProviderError> {
        if self.metadata_down.load(Ordering::SeqCst)
            || self.failing.lock().unwrap().contains(&pool.address)
        {
            return Err(ProviderError::NotFound);
        }
        Ok(PoolMetadata {
            tvl_usd: Some(2_000_000.0),
            volume_24h_usd: Some(1_000_000.0),
            volume_7d_usd: Some(7_000_000.0),
            fee_apr_pct: None,
        })
    }
}
