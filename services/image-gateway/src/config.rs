//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials never live in the TOML. They come from the snapshot file, or
//! from an inline document in the `API_KEYS` env var. The client API token
//! comes from `API_AUTH_TOKEN` only.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::BearerToken;
use key_pool::{PoolConfig, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    /// Inline credential document from `API_KEYS`.
    #[serde(skip)]
    pub inline_credentials: Option<InlineCredentials>,
    /// Token clients must present, from `API_AUTH_TOKEN`. `None` leaves the
    /// API open.
    #[serde(skip)]
    pub api_token: Option<BearerToken>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Upstream image service
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential pool and retry tuning
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub snapshot_path: PathBuf,
    pub max_retries_per_credential: u32,
    pub max_credential_switches: u32,
    pub retry_delay_ms: u64,
    pub invalid_quarantine_secs: u64,
    pub exhausted_quarantine_secs: u64,
    pub working_mark_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("api_keys.json"),
            max_retries_per_credential: 1,
            max_credential_switches: 3,
            retry_delay_ms: 1000,
            invalid_quarantine_secs: 24 * 3600,
            exhausted_quarantine_secs: 6 * 3600,
            working_mark_ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            snapshot_path: Some(self.snapshot_path.clone()),
            invalid_quarantine: Duration::from_secs(self.invalid_quarantine_secs),
            exhausted_quarantine: Duration::from_secs(self.exhausted_quarantine_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries_per_credential: self.max_retries_per_credential,
            max_credential_switches: self.max_credential_switches,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Credential document passed through the environment. Debug output is
/// redacted since it carries secrets.
#[derive(Clone)]
pub struct InlineCredentials(String);

impl InlineCredentials {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InlineCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InlineCredentials({} bytes)", self.0.len())
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// - `KEYS_STORAGE_FILE` replaces `pool.snapshot_path`
    /// - `API_KEYS` supplies an inline credential document
    /// - `API_AUTH_TOKEN` sets the token clients must present
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(file) = std::env::var("KEYS_STORAGE_FILE")
            && !file.trim().is_empty()
        {
            config.pool.snapshot_path = PathBuf::from(file.trim());
        }
        if let Ok(doc) = std::env::var("API_KEYS")
            && !doc.trim().is_empty()
        {
            config.inline_credentials = Some(InlineCredentials(doc));
        }
        if let Ok(token) = std::env::var("API_AUTH_TOKEN") {
            let token = BearerToken::parse(&token);
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream.base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "pool.sweep_interval_secs must be greater than 0".into(),
            ));
        }
        if self.pool.working_mark_ttl_secs == 0 {
            return Err(common::Error::Config(
                "pool.working_mark_ttl_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("image-gateway.toml")
    }
}
