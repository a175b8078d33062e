//! Per-service YAML configuration.
//!
//! Each service loads its own config struct from the path in `CONFIG_PATH`
//! (falling back to a service-local default). Duration fields accept
//! human-readable strings such as `10s` or `5m`.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

fn default_queue_capacity() -> usize {
    100
}

fn default_pool_size() -> usize {
    4
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_upload_mb() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub use_ssl: bool,
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub queue_name: String,
    #[serde(default)]
    pub max_reconnects: usize,
    pub subject: String,
}

/// Ingress HTTP service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub addr: String,
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    pub base_dir: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(with = "humantime_serde")]
    pub task_ttl: Duration,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    pub redis: RedisConfig,
    pub minio: S3Config,
    pub nats: NatsConfig,
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            bail!("config: addr is empty");
        }
        validate_common(&self.base_dir, &self.nats, self.task_ttl)
    }
}

/// Distributor worker-pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributorConfig {
    pub base_dir: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(with = "humantime_serde")]
    pub task_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub task_cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub conversion_timeout: Duration,

    pub converter_addr: String,

    pub redis: RedisConfig,
    pub minio: S3Config,
    pub nats: NatsConfig,
}

impl DistributorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.converter_addr.is_empty() {
            bail!("config: converter_addr is empty");
        }
        if self.task_cleanup_interval.is_zero() {
            bail!("config: task_cleanup_interval must be positive");
        }
        if self.conversion_timeout.is_zero() {
            bail!("config: conversion_timeout must be positive");
        }
        validate_common(&self.base_dir, &self.nats, self.task_ttl)
    }
}

/// Converter gRPC service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConverterConfig {
    pub grpc_addr: String,
    pub base_dir: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    pub minio: S3Config,
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grpc_addr.is_empty() {
            bail!("config: grpc_addr is empty");
        }
        if self.base_dir.is_empty() {
            bail!("config: base_dir is empty");
        }
        Ok(())
    }
}

fn validate_common(base_dir: &str, nats: &NatsConfig, task_ttl: Duration) -> Result<()> {
    if base_dir.is_empty() {
        bail!("config: base_dir is empty");
    }
    if nats.subject.is_empty() {
        bail!("config: nats.subject is empty");
    }
    if task_ttl.is_zero() {
        bail!("config: task_ttl must be positive");
    }
    Ok(())
}

/// Load a config from `CONFIG_PATH`, or `default_path` when unset.
pub fn load<T: DeserializeOwned>(default_path: &str) -> Result<T> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| default_path.to_string());
    load_from(Path::new(&path))
}

pub fn load_from<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("config: cannot read file {}", path.display()))?;
    serde_yaml::from_str(&data)
        .with_context(|| format!("config: cannot parse yaml {}", path.display()))
}
