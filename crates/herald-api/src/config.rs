//! Configuration management for the herald delivery gateway.

use std::{collections::HashMap, net::SocketAddr, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{
    client::ClientConfig,
    retry::{BackoffStrategy, RedeliveryMode, RetryPolicy},
    ManagerConfig, StaticDestinations, TenantDestination,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Tenant destinations can only be declared in the file:
///
/// ```toml
/// global_webhook_url = "https://audit.example.com/events"
///
/// [tenants.tok-123]
/// tenant_id = "tenant-1"
/// webhook_url = "https://tenant-1.example.com/hook"
/// instance_name = "primary"
/// ```
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Admin API will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Destinations
    /// Global webhook receiving every tenant's events. Empty disables it.
    ///
    /// Environment variable: `GLOBAL_WEBHOOK_URL`
    #[serde(default, alias = "GLOBAL_WEBHOOK_URL")]
    pub global_webhook_url: Option<String>,
    /// Per-token tenant destinations.
    #[serde(default)]
    pub tenants: HashMap<String, TenantDestination>,

    // Delivery
    /// Fan-out cycles before an event is marked failed.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "MAX_RETRIES")]
    pub max_retries: u32,
    /// Deadline shared by all channels of one cycle, in milliseconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_MS`
    #[serde(default = "default_delivery_timeout_ms", alias = "DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: u64,
    /// Timeout of a single webhook call in milliseconds.
    ///
    /// Environment variable: `CALL_TIMEOUT_MS`
    #[serde(default = "default_call_timeout_ms", alias = "CALL_TIMEOUT_MS")]
    pub call_timeout_ms: u64,
    /// Concurrently running delivery cycles.
    ///
    /// Environment variable: `MAX_IN_FLIGHT`
    #[serde(default = "default_max_in_flight", alias = "MAX_IN_FLIGHT")]
    pub max_in_flight: usize,
    /// Cycles allowed to wait for a slot before dispatch is deferred.
    ///
    /// Environment variable: `MAX_QUEUED`
    #[serde(default = "default_max_queued", alias = "MAX_QUEUED")]
    pub max_queued: usize,
    /// Failed events kept for inspection.
    ///
    /// Environment variable: `FAILED_ARCHIVE_CAPACITY`
    #[serde(default = "default_failed_archive_capacity", alias = "FAILED_ARCHIVE_CAPACITY")]
    pub failed_archive_capacity: usize,
    /// Grace period for background work on shutdown, in milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[serde(default = "default_shutdown_timeout_ms", alias = "SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,

    // Retry
    /// Sweep interval and base backoff delay in milliseconds.
    ///
    /// Environment variable: `RETRY_INTERVAL_MS`
    #[serde(default = "default_retry_interval_ms", alias = "RETRY_INTERVAL_MS")]
    pub retry_interval_ms: u64,
    /// `fixed` or `exponential`.
    ///
    /// Environment variable: `RETRY_BACKOFF`
    #[serde(default = "default_retry_backoff", alias = "RETRY_BACKOFF")]
    pub retry_backoff: String,
    /// Upper bound for exponential delays in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_retry_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for exponential delays (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,
    /// `all_channels` or `failed_channels_only`.
    ///
    /// Environment variable: `REDELIVERY_MODE`
    #[serde(default = "default_redelivery_mode", alias = "REDELIVERY_MODE")]
    pub redelivery_mode: String,

    // Journal
    /// Append-only journal of pending events. Unset keeps state in memory.
    ///
    /// Environment variable: `JOURNAL_PATH`
    #[serde(default, alias = "JOURNAL_PATH")]
    pub journal_path: Option<String>,

    // Attachments
    /// Directory submitted `file_path` attachments must live under. Unset
    /// rejects every attachment.
    ///
    /// Environment variable: `ATTACHMENT_DIR`
    #[serde(default, alias = "ATTACHMENT_DIR")]
    pub attachment_dir: Option<String>,

    // Server
    /// Admin API bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Admin API bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
    /// `pretty` or `json`.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default = "default_log_format", alias = "LOG_FORMAT")]
    pub log_format: String,
}

impl Config {
    /// Load configuration from defaults, `herald.toml`, and environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`] with an explicit configuration file. A missing
    /// file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery manager's configuration.
    pub fn to_manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig {
            retry_policy: self.to_retry_policy()?,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            global_webhook_url: self
                .global_webhook_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            redelivery_mode: self.redelivery_mode()?,
            max_in_flight: self.max_in_flight,
            max_queued: self.max_queued,
            failed_archive_capacity: self.failed_archive_capacity,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            client_config: ClientConfig {
                default_timeout: Duration::from_millis(self.call_timeout_ms),
                ..ClientConfig::default()
            },
        })
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> Result<RetryPolicy> {
        let strategy = BackoffStrategy::from_str(&self.retry_backoff)
            .map_err(anyhow::Error::msg)
            .context("Invalid retry_backoff")?;

        Ok(RetryPolicy {
            max_retries: self.max_retries,
            interval: Duration::from_millis(self.retry_interval_ms),
            strategy,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        })
    }

    /// Tenant destinations declared under `[tenants.<token>]`.
    pub fn to_destinations(&self) -> StaticDestinations {
        StaticDestinations::new(self.tenants.clone())
    }

    /// Parse server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Whether logs should be emitted as JSON lines.
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    fn redelivery_mode(&self) -> Result<RedeliveryMode> {
        RedeliveryMode::from_str(&self.redelivery_mode)
            .map_err(anyhow::Error::msg)
            .context("Invalid redelivery_mode")
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be greater than 0");
        }

        if self.delivery_timeout_ms == 0 || self.call_timeout_ms == 0 {
            anyhow::bail!("delivery_timeout_ms and call_timeout_ms must be greater than 0");
        }

        if self.retry_interval_ms == 0 {
            anyhow::bail!("retry_interval_ms must be greater than 0");
        }

        if self.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if !matches!(self.log_format.to_ascii_lowercase().as_str(), "pretty" | "json") {
            anyhow::bail!("log_format must be 'pretty' or 'json'");
        }

        self.to_retry_policy()?;
        self.redelivery_mode()?;

        for (token, tenant) in &self.tenants {
            if tenant.tenant_id.trim().is_empty() {
                anyhow::bail!("tenant for token '{token}' is missing tenant_id");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_webhook_url: None,
            tenants: HashMap::new(),
            max_retries: default_max_retries(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            max_queued: default_max_queued(),
            failed_archive_capacity: default_failed_archive_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_backoff: default_retry_backoff(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
            redelivery_mode: default_redelivery_mode(),
            journal_path: None,
            attachment_dir: None,
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            rust_log: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_max_in_flight() -> usize {
    64
}

fn default_max_queued() -> usize {
    1024
}

fn default_failed_archive_capacity() -> usize {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_retry_interval_ms() -> u64 {
    2_000
}

fn default_retry_backoff() -> String {
    "fixed".to_string()
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_retry_jitter_factor() -> f64 {
    0.1
}

fn default_redelivery_mode() -> String {
    "all_channels".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,herald=debug,tower_http=debug".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use std::{env, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        vars: Vec<String>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, vars: Vec::new(), originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            if !self.vars.contains(&key.to_string()) {
                self.originals.insert(key.to_string(), env::var(key).ok());
                self.vars.push(key.to_string());
            }
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for var in &self.vars {
                match self.originals.get(var) {
                    Some(Some(value)) => env::set_var(var, value),
                    Some(None) => env::remove_var(var),
                    None => {},
                }
            }
        }
    }

    fn missing_file() -> std::path::PathBuf {
        std::path::PathBuf::from("does-not-exist/herald.toml")
    }

    #[test]
    fn defaults_match_delivery_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let manager = config.to_manager_config().unwrap();
        let defaults = ManagerConfig::default();
        assert_eq!(manager.retry_policy, defaults.retry_policy);
        assert_eq!(manager.delivery_timeout, defaults.delivery_timeout);
        assert_eq!(manager.call_timeout, defaults.call_timeout);
        assert_eq!(manager.redelivery_mode, defaults.redelivery_mode);
        assert_eq!(manager.max_in_flight, defaults.max_in_flight);
        assert_eq!(manager.max_queued, defaults.max_queued);
        assert!(manager.global_webhook_url.is_none());
        assert!(!config.json_logs());
    }

    #[test]
    fn env_overrides_apply() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("GLOBAL_WEBHOOK_URL", "https://audit.example.com/events");
        guard.set_var("MAX_RETRIES", "5");
        guard.set_var("DELIVERY_TIMEOUT_MS", "2500");
        guard.set_var("RETRY_INTERVAL_MS", "750");
        guard.set_var("RETRY_BACKOFF", "exponential");
        guard.set_var("REDELIVERY_MODE", "failed_channels_only");
        guard.set_var("HOST", "127.0.0.1");
        guard.set_var("PORT", "9191");
        guard.set_var("LOG_FORMAT", "json");
        guard.set_var("ATTACHMENT_DIR", "/var/lib/herald/uploads");

        let config = Config::load_from(missing_file()).expect("config loads with env overrides");
        let manager = config.to_manager_config().unwrap();

        assert_eq!(manager.retry_policy.max_retries, 5);
        assert_eq!(manager.retry_policy.interval, Duration::from_millis(750));
        assert_eq!(manager.retry_policy.strategy, BackoffStrategy::Exponential);
        assert_eq!(manager.delivery_timeout, Duration::from_millis(2500));
        assert_eq!(manager.redelivery_mode, RedeliveryMode::FailedChannelsOnly);
        assert_eq!(
            manager.global_webhook_url.as_deref(),
            Some("https://audit.example.com/events")
        );
        assert_eq!(config.parse_server_addr().unwrap().port(), 9191);
        assert!(config.json_logs());
        assert_eq!(config.attachment_dir.as_deref(), Some("/var/lib/herald/uploads"));
    }

    #[test]
    fn blank_global_webhook_disables_channel() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("GLOBAL_WEBHOOK_URL", "  ");

        let config = Config::load_from(missing_file()).unwrap();
        assert!(config.to_manager_config().unwrap().global_webhook_url.is_none());
    }

    #[test]
    fn tenants_load_from_file() {
        let _guard = TestEnvGuard::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.toml");
        std::fs::write(
            &path,
            r#"
max_retries = 4

[tenants.tok-1]
tenant_id = "tenant-1"
webhook_url = "https://tenant-1.example.com/hook"
instance_name = "primary"

[tenants.tok-2]
tenant_id = "tenant-2"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.tenants.len(), 2);
        assert_eq!(config.tenants["tok-1"].instance_name, "primary");
        assert!(config.tenants["tok-2"].webhook_url.is_empty());
        assert_eq!(config.to_destinations().len(), 2);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = Config { max_retries: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { retry_backoff: "linear".to_string(), ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { redelivery_mode: "sometimes".to_string(), ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { retry_jitter_factor: 1.5, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { log_format: "xml".to_string(), ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { port: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
