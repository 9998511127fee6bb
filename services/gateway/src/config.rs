//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` > `chat-gateway.toml`
//! for the file; `UPSTREAM_BASE_URL` and `DATABASE_PATH` env vars override
//! the file. Every field has a default, so an empty file is a valid config.
//! Credentials never live in this file, only in the credential store.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub images: ImagesConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public OpenAI-compatible API
    pub listen_addr: SocketAddr,
    /// Control console API, keep off public interfaces
    pub admin_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
        }
    }
}

/// Upstream service settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Whole-call bound, including the streamed body
    pub timeout_secs: u64,
    /// Longest silence tolerated between two body reads
    pub read_timeout_secs: u64,
    /// acquire → call cycles per request, counting the first
    pub max_attempts: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://back.zaiwenai.com".into(),
            timeout_secs: 180,
            read_timeout_secs: 60,
            max_attempts: 3,
        }
    }
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub database_path: PathBuf,
    /// Plain-text secret backup, one per line. Empty string disables it.
    pub backup_path: PathBuf,
    pub failure_threshold: u32,
    pub cooldown_base_secs: u64,
    pub cooldown_max_secs: u64,
    /// How long a credential may stay in flight before it is presumed leaked
    pub staleness_window_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/accounts.db"),
            backup_path: PathBuf::from("data/tokens.txt"),
            failure_threshold: 3,
            cooldown_base_secs: 30,
            cooldown_max_secs: 900,
            staleness_window_secs: 600,
        }
    }
}

impl PoolConfig {
    pub fn backup_path(&self) -> Option<PathBuf> {
        (!self.backup_path.as_os_str().is_empty()).then(|| self.backup_path.clone())
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

/// Image task settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    /// Influence of a reference image on image-to-image requests, 0-100
    pub reference_weight: u8,
    /// Fixed reference upload endpoint; unset uses the region the upstream
    /// hands out with each upload token
    pub upload_url: Option<String>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            poll_timeout_secs: 180,
            reference_weight: 50,
            upload_url: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> common::Result<Self> {
        Config::default().finish()
    }

    fn finish(mut self) -> common::Result<Self> {
        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.pool.database_path = PathBuf::from(path);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |msg: String| -> common::Result<()> { Err(common::Error::Config(msg)) };

        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return invalid(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return invalid("timeout_secs must be greater than 0".into());
        }
        if self.upstream.read_timeout_secs == 0 {
            return invalid("read_timeout_secs must be greater than 0".into());
        }
        if self.upstream.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".into());
        }
        if self.server.max_connections == 0 {
            return invalid("max_connections must be greater than 0".into());
        }
        if self.pool.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1".into());
        }
        if self.pool.cooldown_max_secs < self.pool.cooldown_base_secs {
            return invalid(format!(
                "cooldown_max_secs ({}) must not be below cooldown_base_secs ({})",
                self.pool.cooldown_max_secs, self.pool.cooldown_base_secs
            ));
        }
        // A live request must never look leaked to the recovery sweep
        let longest_lease = self.longest_lease().as_secs();
        if self.pool.staleness_window_secs <= longest_lease {
            return invalid(format!(
                "staleness_window_secs ({}) must exceed the longest credential hold ({longest_lease}s)",
                self.pool.staleness_window_secs
            ));
        }
        if self.images.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be greater than 0".into());
        }
        if self.images.reference_weight > 100 {
            return invalid("reference_weight must be between 0 and 100".into());
        }
        if let Some(url) = &self.images.upload_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return invalid(format!("upload_url must start with http:// or https://, got: {url}"));
            }
        }
        Ok(())
    }

    /// Upper bound on how long one request holds its credential.
    ///
    /// An image job is the longest: reference upload, the draw submit under
    /// the whole-call timeout, then polling under the poll timeout. A chat
    /// call is bounded by the whole-call timeout alone.
    pub fn longest_lease(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
            .saturating_add(Duration::from_secs(self.images.poll_timeout_secs))
            .saturating_add(upstream::IMAGE_JOB_OVERHEAD)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-gateway.toml")
    }
}
