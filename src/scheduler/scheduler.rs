use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use rustc_hash::FxHashSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerSettings;
use crate::db::models::{PoolKey, TrackedPool};
use crate::db::Store;
use crate::scheduler::pipeline::PoolPipeline;
use crate::scheduler::tier::is_due;

/// Counters of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tracked: usize,
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Still running from an earlier tick
    pub skipped_in_flight: usize,
    /// Not started before the tick budget ran out
    pub deferred: usize,
}

enum Outcome {
    Succeeded,
    Failed,
    InFlight,
    Deferred,
}

/// Pools currently being refreshed. A pool is claimed for the lifetime of the
/// returned guard.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<FxHashSet<PoolKey>>>);

struct Claim {
    set: InFlight,
    key: PoolKey,
}

impl InFlight {
    fn claim(&self, key: &PoolKey) -> Option<Claim> {
        let mut set = self.0.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(key.clone()).then(|| Claim {
            set: self.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut set = self.set.0.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

/// Drives pool refreshes on tier cadences.
///
/// Every tick loads the tracked pools, keeps those that are due under their
/// effective tier and runs their pipelines with bounded concurrency. A pool
/// failing never affects the others; its error is recorded on its snapshot.
pub struct TierScheduler {
    store: Arc<dyn Store>,
    pipeline: Arc<PoolPipeline>,
    settings: SchedulerSettings,
    in_flight: InFlight,
}

impl TierScheduler {
    pub fn new(store: Arc<dyn Store>, pipeline: Arc<PoolPipeline>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            pipeline,
            settings,
            in_flight: InFlight::default(),
        }
    }

    fn failure_retry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.failure_retry_secs as i64)
    }

    /// Pools due at `now`, most urgent tier first.
    pub fn select_due(&self, tracked: Vec<TrackedPool>, now: DateTime<Utc>) -> Vec<TrackedPool> {
        let promotion = self.pipeline.promotion();
        let mut due: Vec<TrackedPool> = tracked
            .into_iter()
            .filter_map(|mut pool| {
                pool.tier = promotion.effective_tier(&pool.pool.key(), pool.tier, now);
                is_due(&pool, pool.tier, now, self.failure_retry()).then_some(pool)
            })
            .collect();

        // Never-updated pools and stale ones go first within a tier
        due.sort_by_key(|p| (p.tier, p.last_updated));
        due
    }

    /// Run one tick as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.settings.tick_budget_secs);

        let tracked = self
            .store
            .tracked_pools()
            .await
            .context("Failed to load tracked pools")?;
        let mut report = TickReport {
            tracked: tracked.len(),
            ..Default::default()
        };

        let due = self.select_due(tracked, now);
        report.due = due.len();
        if due.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Outcome> = stream::iter(due)
            .map(|tracked| self.refresh(tracked, now, deadline))
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::InFlight => report.skipped_in_flight += 1,
                Outcome::Deferred => report.deferred += 1,
            }
        }

        if report.deferred > 0 {
            warn!(
                "[Scheduler] tick budget exhausted, {} pools deferred to the next tick",
                report.deferred
            );
        }

        Ok(report)
    }

    async fn refresh(
        &self,
        tracked: TrackedPool,
        now: DateTime<Utc>,
        deadline: tokio::time::Instant,
    ) -> Outcome {
        if tokio::time::Instant::now() >= deadline {
            return Outcome::Deferred;
        }

        let key = tracked.pool.key();
        let Some(_claim) = self.in_flight.claim(&key) else {
            debug!("[Scheduler] {} still refreshing, skipped", key);
            return Outcome::InFlight;
        };

        match self.pipeline.run(&tracked.pool, now).await {
            Ok(_) => Outcome::Succeeded,
            Err(e) => {
                error!("[Scheduler] {} ({}) refresh failed: {:#}", key, tracked.tier, e);
                if let Err(store_err) = self
                    .store
                    .record_pool_failure(&key, &format!("{:#}", e), now)
                    .await
                {
                    error!("[Scheduler] failed to record failure of {}: {:#}", key, store_err);
                }
                Outcome::Failed
            },
        }
    }

    async fn run_tick(&self) {
        info!("Starting pool refresh tick...");
        let start = std::time::Instant::now();

        match self.tick(Utc::now()).await {
            Ok(report) => info!(
                "Completed pool refresh tick in {:?} ({} tracked, {} due, {} ok, {} failed, {} skipped, {} deferred)",
                start.elapsed(),
                report.tracked,
                report.due,
                report.succeeded,
                report.failed,
                report.skipped_in_flight,
                report.deferred
            ),
            Err(e) => error!("Pool refresh tick failed: {:#}", e),
        }
    }

    /// Runs a tick immediately, then every `tick_interval_secs` until
    /// cancellation.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        let interval = self.settings.tick_interval_secs;
        let this = self.clone();
        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                this.run_tick().await;
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered pool refresh tick (every {}s)", interval);

        scheduler.start().await?;
        info!("Tier scheduler started");

        tokio::select! {
            _ = self.run_tick() => cancellation_token.cancelled().await,
            _ = cancellation_token.cancelled() => {},
        }
        info!("Tier scheduler shutting down...");

        scheduler.shutdown().await?;
        Ok(())
    }
}
