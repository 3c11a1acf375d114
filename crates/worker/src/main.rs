//! Outbox worker process.
//!
//! Reads `OUTBOX_*` settings from the environment, drains the outbox on a
//! fixed interval, and exits cleanly on Ctrl-C. With `DATABASE_URL` set the
//! Postgres store is used; otherwise an in-memory store (dev only).

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use sprintforge_events::{JsonEventSerializer, ProjectEvent};
use sprintforge_infra::{
    InMemoryOutboxStore, OutboxConfig, OutboxProcessor, OutboxStore, OutboxWorker,
    PostgresOutboxStore,
};

mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sprintforge_observability::init();

    let config = OutboxConfig::from_env().context("invalid outbox configuration")?;
    info!(
        batch_size = config.batch_size,
        max_retry_attempts = config.max_retry_attempts,
        base_backoff = ?config.base_backoff,
        poll_interval = ?config.poll_interval,
        claim_lease = ?config.claim_lease,
        persistent = config.database_url.is_some(),
        "starting outbox worker"
    );

    let store = build_store(&config).await?;
    let processor = OutboxProcessor::new(
        store,
        JsonEventSerializer::<ProjectEvent>::new(),
        handlers::build_dispatcher(),
    )
    .with_batch_size(config.batch_size)
    .with_retry_policy(config.retry_policy())
    .with_name("sprintforge-outbox");

    let handle = OutboxWorker::spawn(Arc::new(processor), config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let stats = handle.shutdown().await;
    info!(
        cycles = stats.cycles,
        failed_cycles = stats.failed_cycles,
        processed = stats.messages_processed,
        retried = stats.messages_retried,
        exhausted = stats.messages_exhausted,
        "outbox worker stopped"
    );

    Ok(())
}

async fn build_store(config: &OutboxConfig) -> anyhow::Result<Arc<dyn OutboxStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory outbox store");
        return Ok(Arc::new(
            InMemoryOutboxStore::new()
                .with_max_retry_attempts(config.max_retry_attempts)
                .with_claim_lease(config.claim_lease),
        ));
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresOutboxStore::new(pool)
        .with_max_retry_attempts(config.max_retry_attempts)
        .with_claim_lease(config.claim_lease);
    store
        .ensure_schema()
        .await
        .context("failed to prepare outbox schema")?;

    Ok(Arc::new(store))
}
