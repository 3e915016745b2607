use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// Where quota counters are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    Redis,
    Postgres,
    Memory,
}

impl FromStr for CounterBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(CounterBackend::Redis),
            "postgres" | "postgresql" => Ok(CounterBackend::Postgres),
            "memory" => Ok(CounterBackend::Memory),
            other => Err(anyhow!(
                "QUOTA_STORE must be one of redis, postgres, memory (got '{other}')"
            )),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub port: u16,
    pub rust_log: String,
    pub quota_store: CounterBackend,
    pub quota_key_prefix: String,
    /// JSON file replacing the built-in limits for the actions it names.
    pub quota_policy_file: Option<PathBuf>,
    pub compaction_interval: Duration,
    /// Take the client origin from `X-Forwarded-For`.
    pub trust_proxy: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let quota_store: CounterBackend = optional_env("QUOTA_STORE")
            .unwrap_or_else(|| "redis".to_string())
            .parse()?;
        let redis_url = optional_env("REDIS_URL");
        if quota_store == CounterBackend::Redis && redis_url.is_none() {
            bail!("Required environment variable 'REDIS_URL' is not set (QUOTA_STORE=redis)");
        }

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url,
            port: optional_env("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: optional_env("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            quota_store,
            quota_key_prefix: optional_env("QUOTA_KEY_PREFIX").unwrap_or_else(|| "rl:".to_string()),
            quota_policy_file: optional_env("QUOTA_POLICY_FILE").map(PathBuf::from),
            compaction_interval: Duration::from_secs(
                optional_env("QUOTA_COMPACTION_INTERVAL_SECS")
                    .unwrap_or_else(|| "300".to_string())
                    .parse::<u64>()
                    .context("QUOTA_COMPACTION_INTERVAL_SECS must be a whole number of seconds")?
                    .max(1),
            ),
            trust_proxy: optional_env("TRUST_PROXY")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            database_url: "postgres://localhost/quota_test".to_string(),
            redis_url: None,
            port: 0,
            rust_log: "debug".to_string(),
            quota_store: CounterBackend::Memory,
            quota_key_prefix: "rl:".to_string(),
            quota_policy_file: None,
            compaction_interval: Duration::from_secs(300),
            trust_proxy: false,
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
