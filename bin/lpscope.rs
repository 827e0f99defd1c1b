use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use lpscope::db::{self, models::AlertEvent};
use lpscope::fetch::build_providers;
use lpscope::{
    Database, FetchClient, PoolPipeline, PromotionPolicy, RateLimiterSet, Settings, TierScheduler,
};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .context("Failed to initialize logger")?;

    // Load configuration
    let settings = Arc::new(
        Settings::new()
            .context("Failed to load config.yaml. Please ensure it exists and is valid")?,
    );

    let db = Database::new(settings.clone())
        .await
        .context("Failed to initialize database connection")?;
    let store = db.store();

    let seeded = db::seed_tracked(store.as_ref(), &settings.tracked)
        .await
        .context("Failed to seed tracked pools")?;
    info!("{} pools seeded from config", seeded);

    let limiters = Arc::new(RateLimiterSet::new(&settings.rate_limits, store.clone()));
    let providers = build_providers(&settings, limiters)?;
    let fetch = Arc::new(FetchClient::new(providers, &settings.fetch));

    let cancellation_token = CancellationToken::new();

    // Alert feed: fired alerts are persisted by the pipeline and forwarded here
    let (alert_tx, alert_rx) = mpsc::channel::<AlertEvent>(256);
    let alert_handle = tokio::spawn(drain_alerts(alert_rx));

    let pipeline = PoolPipeline::new(
        store.clone(),
        fetch,
        Arc::new(PromotionPolicy::from_settings(&settings.promotion)),
        &settings.analytics,
        &settings.scheduler,
    )
    .with_alert_feed(alert_tx);

    let scheduler = Arc::new(TierScheduler::new(
        store,
        Arc::new(pipeline),
        settings.scheduler.clone(),
    ));

    let scheduler_token = cancellation_token.child_token();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_token).await {
            error!("Tier scheduler failed: {:#}", e);
        }
    });

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("lpscope running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    cancellation_token.cancel();

    info!("Waiting for tier scheduler to stop...");
    let _ = scheduler_handle.await;

    // Jobs still registered may hold an alert sender, do not wait forever
    if tokio::time::timeout(Duration::from_secs(5), alert_handle)
        .await
        .is_err()
    {
        warn!("Alert feed did not drain in time");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn drain_alerts(mut alert_rx: mpsc::Receiver<AlertEvent>) {
    while let Some(event) = alert_rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => warn!("ALERT {}", json),
            Err(e) => error!("Failed to encode alert {}: {}", event.alert_id, e),
        }
    }
}
