//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the GEMINI_API_KEYS env var or `api_keys_file`,
//! never stored in the TOML directly to avoid leaking secrets.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use common::Secret;
use key_pool::{PoolConfig, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    /// Seed keys, resolved from env or `pool.api_keys_file`
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// Forwarding listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Admin API listener. Kept off the public port.
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen_addr")]
    pub listen_addr: SocketAddr,
}

/// Key budgets and retry behaviour
#[derive(Debug, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: u32,
    #[serde(default = "default_minute_limit")]
    pub default_minute_limit: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    /// IANA zone in which the provider resets daily quotas
    #[serde(default = "default_reset_timezone")]
    pub reset_timezone: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// File with one key per line (or comma separated). Ignored when GEMINI_API_KEYS is set.
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_admin_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_daily_limit() -> u32 {
    250
}

fn default_minute_limit() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_retry_delay() -> u64 {
    30
}

fn default_reset_timezone() -> String {
    "America/Los_Angeles".into()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    60
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_listen_addr(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_daily_limit: default_daily_limit(),
            default_minute_limit: default_minute_limit(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            reset_timezone: default_reset_timezone(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            api_keys_file: None,
        }
    }
}

/// Overwrite `slot` with the parsed value of env var `name`, if set.
fn env_override<T>(name: &str, slot: &mut T) -> common::Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| common::Error::Config(format!("invalid {name}={raw:?}: {e}")))?;
    }
    Ok(())
}

/// Split a key list on commas and newlines. Blank entries and `#` comments are skipped.
pub fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| Secret::new(key.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Key resolution order:
    /// 1. GEMINI_API_KEYS env var
    /// 2. api_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse, overlay env and validate. Split from `load` so tests skip the file.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env()?;
        config.resolve_keys()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        let mut host: IpAddr = self.proxy.listen_addr.ip();
        let mut port: u16 = self.proxy.listen_addr.port();
        env_override("HOST", &mut host)?;
        env_override("PORT", &mut port)?;
        self.proxy.listen_addr = SocketAddr::new(host, port);

        env_override("GEMINI_BASE_URL", &mut self.proxy.upstream_url)?;
        env_override("DEFAULT_RPD_LIMIT", &mut self.pool.default_daily_limit)?;
        env_override("DEFAULT_RPM_LIMIT", &mut self.pool.default_minute_limit)?;
        env_override("MAX_RETRIES", &mut self.pool.max_retries)?;
        env_override("RETRY_DELAY_SECONDS", &mut self.pool.retry_delay_secs)?;
        Ok(())
    }

    fn resolve_keys(&mut self) -> common::Result<()> {
        if let Ok(raw) = std::env::var("GEMINI_API_KEYS") {
            self.api_keys = parse_keys(&raw);
        } else if let Some(ref keys_file) = self.pool.api_keys_file {
            let raw = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            self.api_keys = parse_keys(&raw);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        // Validate upstream_url is a valid URL with http(s) scheme
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.pool.default_daily_limit == 0 || self.pool.default_minute_limit == 0 {
            return Err(common::Error::Config(
                "default_daily_limit and default_minute_limit must be greater than 0".into(),
            ));
        }

        if self.pool.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }

        if self.pool.failure_threshold == 0 {
            return Err(common::Error::Config(
                "failure_threshold must be greater than 0".into(),
            ));
        }

        // Checks reset_timezone and cooldown_secs
        self.pool_config()?;

        if self.api_keys.is_empty() {
            return Err(common::Error::Config(
                "no API keys configured: set GEMINI_API_KEYS or pool.api_keys_file".into(),
            ));
        }

        Ok(())
    }

    pub fn reset_zone(&self) -> common::Result<Tz> {
        self.pool.reset_timezone.parse::<Tz>().map_err(|e| {
            common::Error::Config(format!(
                "invalid reset_timezone {:?}: {e}",
                self.pool.reset_timezone
            ))
        })
    }

    pub fn pool_config(&self) -> common::Result<PoolConfig> {
        Ok(PoolConfig {
            default_daily_limit: self.pool.default_daily_limit,
            default_minute_limit: self.pool.default_minute_limit,
            reset_zone: self.reset_zone()?,
            failure_threshold: self.pool.failure_threshold,
            cooldown: self.cooldown()?,
        })
    }

    fn cooldown(&self) -> common::Result<chrono::Duration> {
        i64::try_from(self.pool.cooldown_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                common::Error::Config(format!(
                    "cooldown_secs is out of range: {}",
                    self.pool.cooldown_secs
                ))
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.pool.max_retries,
            retry_delay: Duration::from_secs(self.pool.retry_delay_secs),
            max_retry_delay: Duration::from_secs(self.pool.max_retry_delay_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-key-proxy.toml")
    }
}
