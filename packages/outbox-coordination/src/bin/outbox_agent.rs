// Entry point for the outbox event-processor agents of one process

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use outbox_coordination::{
    Config, EventBatchProcessor, EventProcessorRunner, OutboxEvent, PgStore, ProcessingOutcome,
    PulseContext, Sharding, ShardingConfig, SystemClock, TracingFailureHandler, UniformHashRanges,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Acknowledges every event after logging it.
///
/// Stands in for a real indexer so the coordination can be exercised against
/// a live database.
struct LoggingProcessor;

#[async_trait]
impl EventBatchProcessor for LoggingProcessor {
    async fn process(&self, events: &[OutboxEvent]) -> ProcessingOutcome {
        let mut outcome = ProcessingOutcome::default();
        for event in events {
            tracing::info!(
                event_id = %event.id,
                entity = %event.entity_reference(),
                retries = event.retries,
                "indexing entity"
            );
            outcome.succeed(event.id);
        }
        outcome
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outbox_coordination=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting outbox agent");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(sharding = ?config.sharding, "Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    let store = Arc::new(PgStore::new(pool));

    // Run migrations
    tracing::info!("Running database migrations...");
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let context = PulseContext {
        agents: store.clone(),
        clock: Arc::new(SystemClock),
        failure_handler: Arc::new(TracingFailureHandler),
    };
    let processor: Arc<dyn EventBatchProcessor> = Arc::new(LoggingProcessor);

    let shardings: Vec<(String, Sharding)> = match &config.sharding {
        ShardingConfig::Dynamic => vec![(config.agent_name.clone(), Sharding::Dynamic)],
        ShardingConfig::Static(assignments) => assignments
            .iter()
            .map(|assignment| {
                (
                    format!("{}-{}", config.agent_name, assignment.index()),
                    Sharding::Static(*assignment),
                )
            })
            .collect(),
    };

    let shutdown = CancellationToken::new();
    let mut handles = Vec::with_capacity(shardings.len());
    for (name, sharding) in shardings {
        let runner = EventProcessorRunner::new(
            name,
            sharding,
            Arc::new(UniformHashRanges),
            context.clone(),
            store.clone(),
            processor.clone(),
            config.pulse,
            config.processing,
        );
        handles.push(tokio::spawn(runner.run(shutdown.child_token())));
    }
    tracing::info!(agents = handles.len(), "Event processors started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, leaving the cluster");
    shutdown.cancel();

    for result in futures::future::join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "event processor stopped with an error"),
            Err(e) => tracing::error!(error = %e, "event processor task panicked"),
        }
    }

    tracing::info!("Outbox agent stopped");
    Ok(())
}
