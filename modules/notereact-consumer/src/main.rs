use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notereact_cache::{CacheStore, PgCacheStore, ReactionCache};
use notereact_common::PipelineConfig;
use notereact_consumer::{ConsumerConfig, StreamConsumer};
use notereact_store::{PgReactionRepository, ReactionRepository};
use notereact_stream::{EventLog, PgEventLog};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting reaction-consumer");

    let config = PipelineConfig::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    let log = PgEventLog::new(pool.clone());
    log.migrate().await.context("Stream log migrations failed")?;
    let repository = PgReactionRepository::new(pool.clone());
    repository
        .migrate()
        .await
        .context("Reaction store migrations failed")?;
    let cache_store = PgCacheStore::new(pool.clone(), config.cache_partitions);
    cache_store
        .migrate()
        .await
        .context("Cache store migrations failed")?;
    tracing::info!("Migrations complete");

    let eviction = spawn_cache_eviction(cache_store.clone(), config.cache_ttl);

    let log: Arc<dyn EventLog> = Arc::new(log);
    let repository: Arc<dyn ReactionRepository> = Arc::new(repository);
    let store: Arc<dyn CacheStore> = Arc::new(cache_store);
    let cache = ReactionCache::new(store, repository.clone(), config.cache_ttl);

    let mut consumers = Vec::with_capacity(config.shards.len());
    for shard in &config.shards {
        let consumer = Arc::new(StreamConsumer::new(
            ConsumerConfig::from_pipeline(&config, *shard),
            log.clone(),
            repository.clone(),
            cache.clone(),
        ));
        consumer
            .start()
            .await
            .with_context(|| format!("Failed to start consumer for shard {shard}"))?;
        consumers.push(consumer);
    }

    tracing::info!(shards = ?config.shards, "Consumers running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining consumers");

    futures::future::join_all(consumers.iter().map(|c| c.stop())).await;
    eviction.abort();

    tracing::info!("reaction-consumer stopped");
    Ok(())
}

/// Periodically drop lapsed cache rows. Reads already ignore them.
fn spawn_cache_eviction(store: PgCacheStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            match store.evict_expired().await {
                Ok(0) => {}
                Ok(evicted) => tracing::debug!(evicted, "Evicted expired cache entries"),
                Err(e) => tracing::warn!(error = %e, "Cache eviction failed"),
            }
        }
    })
}
