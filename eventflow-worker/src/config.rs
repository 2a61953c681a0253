use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "REDIS_URL")]
    pub redis_url: String,

    #[envconfig(default = "3")]
    pub worker_count: usize,

    #[envconfig(default = "worker-1")]
    pub worker_id: String,

    #[envconfig(default = "event_queue")]
    pub stream_name: String,

    #[envconfig(default = "event_processors")]
    pub consumer_group: String,

    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(from = "BLOCK_TIMEOUT_MS", default = "5000")]
    pub block_timeout: EnvMsDuration,

    #[envconfig(from = "IDLE_RECLAIM_MS", default = "60000")]
    pub idle_reclaim: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub retry_base_s: u64,

    #[envconfig(default = "10")]
    pub retry_max_s: u64,

    #[envconfig(from = "STORE_TIMEOUT_MS", default = "10000")]
    pub store_timeout: EnvMsDuration,

    #[envconfig(from = "DRAIN_DEADLINE_MS", default = "30000")]
    pub drain_deadline: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub high_value_threshold: f64,

    pub pg_pool_size: Option<u32>,

    #[envconfig(default = "0.0.0.0:9091")]
    pub metrics_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: String,
}

impl Config {
    /// Pool sizing: one connection per worker with the same again as
    /// headroom, plus overflow, unless overridden.
    pub fn pool_size(&self) -> u32 {
        self.pg_pool_size
            .unwrap_or(2 * self.worker_count as u32 + 4)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
