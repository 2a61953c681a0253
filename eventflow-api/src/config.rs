use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "0.0.0.0:8000")]
    pub address: SocketAddr,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "REDIS_URL")]
    pub redis_url: String,

    #[envconfig(default = "event_queue")]
    pub stream_name: String,

    #[envconfig(default = "event_processors")]
    pub consumer_group: String,

    #[envconfig(default = "10")]
    pub pg_pool_size: u32,

    #[envconfig(default = "10000")]
    pub store_timeout_ms: u64,

    #[envconfig(default = "0.0.0.0:9091")]
    pub metrics_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: String,
}
