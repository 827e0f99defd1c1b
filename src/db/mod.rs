use std::sync::Arc;

use anyhow::Context;
use log::info;

use crate::config::{Settings, TrackedPoolSettings};
use crate::db::models::{Pool, Tier};

mod memory;
pub mod models;
pub mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresClient;
pub use store::Store;

/// Logical position name used for pools declared in the config file.
pub const CONFIG_POSITION: &str = "config";

/// Database handle for the engine.
///
/// PostgreSQL holds everything: pool registry, tiers, price observations,
/// analytics snapshots, history, usage counters and alerts.
#[derive(Clone)]
pub struct Database {
    pub postgres: Arc<PostgresClient>,
}

impl Database {
    pub async fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        let postgres = PostgresClient::new(settings.postgres.clone()).await?;

        // Run migrations
        postgres.migrate().await?;

        Ok(Self {
            postgres: Arc::new(postgres),
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.postgres.clone()
    }
}

/// Register the pools listed under `tracked:` in the config and assign their tiers.
///
/// Pools already known keep their metadata. The tier is written under the
/// [`CONFIG_POSITION`] position so user-created positions are left alone.
pub async fn seed_tracked(
    store: &dyn Store,
    tracked_pools: &[TrackedPoolSettings],
) -> anyhow::Result<usize> {
    for tracked in tracked_pools {
        let pool = Pool::new(
            &tracked.network,
            &tracked.address,
            &tracked.token0,
            &tracked.token1,
            &tracked.token0_symbol,
            &tracked.token1_symbol,
            tracked.fee_tier,
            &tracked.protocol,
        );
        let key = pool.key();

        store
            .upsert_pool(&pool)
            .await
            .with_context(|| format!("Failed to register pool {}", key))?;
        store
            .set_position_tier(&key, CONFIG_POSITION, tracked.tier)
            .await
            .with_context(|| format!("Failed to set tier for pool {}", key))?;

        info!(
            "Tracking {} {} ({}, tier {})",
            key,
            pool.pair_label(),
            pool.protocol,
            tracked.tier
        );
    }

    Ok(tracked_pools.len())
}
