use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Defaults applied to every connection unless its own
/// [`ConnectionConfig`] overrides them.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            workers: default_workers(),
            requests_per_hour: default_requests_per_hour(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_workers() -> usize {
    4
}
fn default_requests_per_hour() -> u32 {
    18000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Capacity of the page queue between collector workers and a table
    /// writer. A full queue suspends the workers.
    #[serde(default = "default_queue_pages")]
    pub queue_pages: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_pages: default_queue_pages(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_queue_pages() -> usize {
    8
}

/// Per-plugin connection settings, assembled explicitly by the plugin
/// that owns them. The collector borrows this read-only for the duration
/// of a task.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Base URL of the remote API, e.g. `https://api.example.com`.
    pub endpoint: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Bearer token sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: default_requests_per_hour(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RuntimeConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.api.timeout_secs == 0 {
        anyhow::bail!("api.timeout_secs must be > 0");
    }

    if config.api.workers == 0 {
        anyhow::bail!("api.workers must be >= 1");
    }

    if config.api.requests_per_hour == 0 {
        anyhow::bail!("api.requests_per_hour must be > 0");
    }

    if config.writer.batch_size == 0 {
        anyhow::bail!("writer.batch_size must be > 0");
    }

    if config.writer.queue_pages == 0 {
        anyhow::bail!("writer.queue_pages must be >= 1");
    }

    Ok(config)
}
