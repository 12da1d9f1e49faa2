// Scheduler binary entry point

use common::clock::SystemClock;
use common::config::{DedupBackend, Settings};
use common::dedup::{DedupStore, MemoryDedupStore, RedisDedupStore};
use common::dispatcher::Dispatcher;
use common::driver::{Driver, DriverConfig, TickDriver};
use common::queue::{JobEnqueuer, NatsClient, NatsConfig, NatsJobEnqueuer};
use common::store::RedisPool;
use common::table::ScheduleTable;
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    settings.validate()?;

    // Initialize structured logging and metrics
    telemetry::init_logging(&settings.observability.log_level)?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting recurring-job scheduler");

    // Build and validate the schedule table; an invalid table stops startup
    let table = ScheduleTable::from_raw(&settings.schedule).map_err(|e| {
        error!(error = %e, "Schedule table validation failed");
        e
    })?;

    if table.is_empty() {
        warn!("Schedule table is empty, nothing will ever be dispatched");
    }
    for definition in table.iter() {
        info!(
            task_key = %definition.key,
            cron = %definition.cron,
            job_class = %definition.job_class,
            priority = definition.priority,
            "Recurring task loaded"
        );
    }

    if !settings.scheduler.enabled {
        info!("Scheduler is disabled by configuration, exiting");
        return Ok(());
    }

    // Select the dedup guard backend
    let dedup: Arc<dyn DedupStore> = match settings.scheduler.dedup_backend {
        DedupBackend::Redis => {
            info!("Initializing Redis dedup store");
            let pool = RedisPool::new(&settings.redis).await.map_err(|e| {
                error!(error = %e, "Failed to initialize Redis pool");
                e
            })?;
            pool.health_check().await?;
            Arc::new(
                RedisDedupStore::new(pool).with_record_ttl(Duration::from_secs(
                    settings.scheduler.dedup_record_ttl_seconds,
                )),
            )
        }
        DedupBackend::Memory => {
            warn!(
                "In-process dedup store selected, run exactly one scheduler instance \
                 or fires will be duplicated"
            );
            Arc::new(MemoryDedupStore::new())
        }
    };
    info!("Dedup store initialized");

    // Connect to NATS and ensure the dispatch stream exists
    info!("Initializing NATS client");
    let nats_config = NatsConfig {
        url: settings.nats.url.clone(),
        stream_name: settings.nats.stream_name.clone(),
        ..NatsConfig::default()
    };
    let nats_client = NatsClient::new(nats_config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize NATS client");
        e
    })?;
    nats_client.initialize_stream().await.map_err(|e| {
        error!(error = %e, "Failed to initialize NATS stream");
        e
    })?;
    info!("NATS stream initialized");

    // Build the enqueue path
    let enqueuer = Arc::new(NatsJobEnqueuer::new(nats_client)) as Arc<dyn JobEnqueuer>;
    let dispatcher = Arc::new(Dispatcher::new(
        enqueuer,
        settings.scheduler.max_dispatch_attempts,
    ));
    info!("Dispatcher initialized");

    // Create the tick driver
    let driver_config = DriverConfig {
        tick_interval_seconds: settings.scheduler.tick_interval_seconds,
    };
    let driver = Arc::new(TickDriver::new(
        driver_config,
        Arc::new(table),
        dedup,
        dispatcher,
        Arc::new(SystemClock),
    ));
    info!("Tick driver created");

    // Set up graceful shutdown on SIGINT
    let driver_for_shutdown = driver.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = driver_for_shutdown.stop().await {
            error!(error = %e, "Error during driver shutdown");
        }
    });

    // Run the tick loop until shutdown
    info!("Starting tick loop");
    if let Err(e) = driver.start().await {
        error!(error = %e, "Tick driver error");
        return Err(e);
    }

    info!("Scheduler stopped");
    Ok(())
}
