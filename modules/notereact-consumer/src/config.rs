use std::time::Duration;

use notereact_common::PipelineConfig;
use notereact_stream::StreamKeys;
use typed_builder::TypedBuilder;

/// Settings for one shard's consumer.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ConsumerConfig {
    pub keys: StreamKeys,
    #[builder(setter(into))]
    pub consumer_name: String,
    #[builder(default = 100)]
    pub batch_size: usize,
    #[builder(default = Duration::from_secs(2))]
    pub block_timeout: Duration,
    /// Attempts beyond this many send an entry to the dead-letter log.
    #[builder(default = 5)]
    pub max_retries: u32,
    /// Pause after a failed poll cycle.
    #[builder(default = Duration::from_secs(1))]
    pub restart_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub reclaim_min_idle: Duration,
    #[builder(default = Duration::from_secs(15))]
    pub reclaim_interval: Duration,
    /// Delete entries from the log once acknowledged.
    #[builder(default)]
    pub purge_acked: bool,
}

impl ConsumerConfig {
    pub fn from_pipeline(config: &PipelineConfig, shard: u32) -> Self {
        Self::builder()
            .keys(StreamKeys::new(
                &config.stream_basename,
                &config.group_basename,
                shard,
            ))
            .consumer_name(config.consumer_name.clone())
            .batch_size(config.batch_size)
            .block_timeout(config.block_timeout)
            .max_retries(config.max_retries)
            .restart_delay(config.restart_delay)
            .reclaim_min_idle(config.reclaim_min_idle)
            .reclaim_interval(config.reclaim_interval)
            .purge_acked(config.purge_acked)
            .build()
    }
}
