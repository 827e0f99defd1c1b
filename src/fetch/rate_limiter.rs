use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitSettings;
use crate::db::Store;
use crate::utils::hour_bucket;

/// Result of a non-blocking acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Call recorded in the window under this id.
    Granted(u64),
    /// Window full; the oldest entry expires after this long.
    Wait(Duration),
}

/// Sliding-window limiter for one external service.
///
/// Holds the grant instants of the last `window`. The lock is only held to
/// prune and push, never across a sleep.
pub struct ServiceLimiter {
    service: String,
    max_requests: usize,
    window: Duration,
    granted: Mutex<VecDeque<(u64, Instant)>>,
    next_id: AtomicU64,
}

impl ServiceLimiter {
    pub fn new(service: impl Into<String>, settings: RateLimitSettings) -> Self {
        Self {
            service: service.into(),
            max_requests: settings.max_requests.max(1),
            window: settings.window(),
            granted: Mutex::new(VecDeque::with_capacity(settings.max_requests)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn try_acquire(&self) -> Acquire {
        let mut granted = self.granted.lock().await;
        let now = Instant::now();

        while let Some((_, at)) = granted.front() {
            if now.duration_since(*at) >= self.window {
                granted.pop_front();
            } else {
                break;
            }
        }

        if granted.len() < self.max_requests {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            granted.push_back((id, now));
            return Acquire::Granted(id);
        }

        let wait = granted
            .front()
            .map(|(_, oldest)| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or_default();
        Acquire::Wait(wait)
    }

    /// Wait until the window has room, then record the call.
    pub async fn acquire(&self) -> u64 {
        loop {
            match self.try_acquire().await {
                Acquire::Granted(id) => return id,
                Acquire::Wait(wait) => {
                    debug!(
                        "[RateLimit] {} at {} reqs/{:?}, waiting {:.2}s",
                        self.service,
                        self.max_requests,
                        self.window,
                        wait.as_secs_f32()
                    );
                    // A zero wait would spin while another task holds the last slot
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                },
            }
        }
    }

    /// Remove a grant the provider never saw.
    pub async fn refund(&self, id: u64) {
        let mut granted = self.granted.lock().await;
        if let Some(pos) = granted.iter().position(|(g, _)| *g == id) {
            granted.remove(pos);
        }
    }

    pub async fn in_window(&self) -> usize {
        let granted = self.granted.lock().await;
        let now = Instant::now();
        granted
            .iter()
            .filter(|(_, at)| now.duration_since(*at) < self.window)
            .count()
    }
}

/// A granted call. Either [`commit`](Permit::commit) it once the provider
/// accepted the request, or [`refund`](Permit::refund) it.
#[must_use]
pub struct Permit {
    limiter: Option<Arc<ServiceLimiter>>,
    id: u64,
    service: String,
    endpoint: &'static str,
    store: Arc<dyn Store>,
}

impl Permit {
    /// Count the call in the persisted hourly usage.
    pub async fn commit(self) {
        let bucket = hour_bucket(Utc::now());
        if let Err(e) = self
            .store
            .increment_api_usage(&self.service, self.endpoint, bucket)
            .await
        {
            warn!(
                "[RateLimit] Failed to record usage for {}/{}: {:#}",
                self.service, self.endpoint, e
            );
        }
    }

    pub async fn refund(self) {
        if let Some(limiter) = &self.limiter {
            limiter.refund(self.id).await;
        }
    }
}

/// Per-service limiters shared by every provider call.
///
/// Services without a configured quota are granted immediately but their
/// usage is still recorded.
pub struct RateLimiterSet {
    limiters: FxHashMap<String, Arc<ServiceLimiter>>,
    store: Arc<dyn Store>,
}

impl RateLimiterSet {
    pub fn new(limits: &HashMap<String, RateLimitSettings>, store: Arc<dyn Store>) -> Self {
        let limiters = limits
            .iter()
            .map(|(service, settings)| {
                (
                    service.clone(),
                    Arc::new(ServiceLimiter::new(service.clone(), *settings)),
                )
            })
            .collect();

        Self { limiters, store }
    }

    pub fn limiter(&self, service: &str) -> Option<&Arc<ServiceLimiter>> {
        self.limiters.get(service)
    }

    pub async fn acquire(&self, service: &str, endpoint: &'static str) -> Permit {
        let limiter = self.limiters.get(service).cloned();
        let id = match &limiter {
            Some(limiter) => limiter.acquire().await,
            None => 0,
        };

        Permit {
            limiter,
            id,
            service: service.to_string(),
            endpoint,
            store: self.store.clone(),
        }
    }
}
