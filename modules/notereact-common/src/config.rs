use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Pipeline configuration loaded from environment variables.
/// Only `DATABASE_URL` is required; everything else has a working default.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Log naming
    pub stream_basename: String,
    pub group_basename: String,
    pub shards: Vec<u32>,
    pub consumer_name: String,

    // Consumer loop
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub max_retries: u32,
    pub restart_delay: Duration,
    pub reclaim_min_idle: Duration,
    pub reclaim_interval: Duration,
    pub purge_acked: bool,

    // Cache
    pub cache_ttl: Duration,
    pub cache_partitions: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 8)?,
            stream_basename: env::var("REACTIONS_STREAM")
                .unwrap_or_else(|_| "reactions".to_string()),
            group_basename: env::var("REACTIONS_GROUP")
                .unwrap_or_else(|_| "reaction-workers".to_string()),
            shards: parse_shards(&env::var("REACTIONS_SHARDS").unwrap_or_else(|_| "0".into()))?,
            consumer_name: env::var("REACTIONS_CONSUMER_NAME").unwrap_or_else(|_| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("consumer-{}", &id[..8])
            }),
            batch_size: env_or("REACTIONS_BATCH_SIZE", 100)?,
            block_timeout: Duration::from_millis(env_or("REACTIONS_BLOCK_MS", 2_000)?),
            max_retries: env_or("REACTIONS_MAX_RETRIES", 5)?,
            restart_delay: Duration::from_millis(env_or("REACTIONS_RESTART_DELAY_MS", 1_000)?),
            reclaim_min_idle: Duration::from_millis(env_or("REACTIONS_RECLAIM_IDLE_MS", 30_000)?),
            reclaim_interval: Duration::from_millis(env_or(
                "REACTIONS_RECLAIM_INTERVAL_MS",
                15_000,
            )?),
            purge_acked: env_or("REACTIONS_PURGE_ACKED", false)?,
            cache_ttl: Duration::from_secs(env_or("REACTIONS_CACHE_TTL_SECS", 3_600)?),
            cache_partitions: env_or("REACTIONS_CACHE_PARTITIONS", 16)?,
        };

        if config.batch_size == 0 {
            anyhow::bail!("REACTIONS_BATCH_SIZE must be at least 1");
        }
        if config.cache_partitions == 0 {
            anyhow::bail!("REACTIONS_CACHE_PARTITIONS must be at least 1");
        }

        config.log_settings();
        Ok(config)
    }

    fn log_settings(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        tracing::info!(
            stream = self.stream_basename.as_str(),
            group = self.group_basename.as_str(),
            shards = ?self.shards,
            consumer = self.consumer_name.as_str(),
            "  Log naming"
        );
        tracing::info!(
            batch_size = self.batch_size,
            block_ms = self.block_timeout.as_millis() as u64,
            max_retries = self.max_retries,
            reclaim_idle_ms = self.reclaim_min_idle.as_millis() as u64,
            purge_acked = self.purge_acked,
            "  Consumer loop"
        );
        tracing::info!(
            ttl_secs = self.cache_ttl.as_secs(),
            partitions = self.cache_partitions,
            "  Cache"
        );
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_shards(raw: &str) -> Result<Vec<u32>> {
    let shards = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("REACTIONS_SHARDS entry is not a shard number: {s:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if shards.is_empty() {
        anyhow::bail!("REACTIONS_SHARDS must name at least one shard");
    }
    Ok(shards)
}

/// Hide the password portion of a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let userinfo = &url[scheme + 3..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_parse_as_comma_list() {
        assert_eq!(parse_shards("0, 1,2").unwrap(), vec![0, 1, 2]);
        assert!(parse_shards("").is_err());
        assert!(parse_shards("a").is_err());
    }

    #[test]
    fn url_password_is_redacted() {
        assert_eq!(
            redact_url("postgres://app:secret@db:5432/notes"),
            "postgres://app:***@db:5432/notes"
        );
        assert_eq!(redact_url("postgres://db/notes"), "postgres://db/notes");
    }
}
