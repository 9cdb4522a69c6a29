pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_thread_stack_size_kb: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_thread_stack_size_kb: Option<usize>,
    #[serde(default)]
    base_path: String,
    #[serde(default)]
    trust_forwarded_headers: bool,
    #[serde(default)]
    tcp_reuse_port_listener_count: Option<usize>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            runtime_thread_stack_size_kb: wire.runtime_thread_stack_size_kb,
            base_path: wire.base_path,
            trust_forwarded_headers: wire.trust_forwarded_headers,
            tcp_reuse_port_listener_count: wire.tcp_reuse_port_listener_count,
            log_level: wire.log_level,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            runtime_thread_stack_size_kb: None,
            base_path: String::new(),
            trust_forwarded_headers: false,
            tcp_reuse_port_listener_count: None,
            log_level: default_log_level(),
        }
    }
}

/// Rate limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_rpm_window_secs")]
    pub rpm_window_secs: u64,
    #[serde(default = "default_tpm_window_secs")]
    pub tpm_window_secs: u64,
    /// Admit the request when the limiter backend itself errors, rather
    /// than rejecting it, as an explicit switch.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

fn default_rpm_window_secs() -> u64 {
    60
}
fn default_tpm_window_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rpm_window_secs: default_rpm_window_secs(),
            tpm_window_secs: default_tpm_window_secs(),
            fail_open: true,
        }
    }
}

/// Channel health-check tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failures/successes before flipping a channel's health
    ///.
    #[serde(default = "default_health_threshold")]
    pub threshold: u32,
    #[serde(default = "default_health_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_health_interval_secs() -> u64 {
    30
}
fn default_health_threshold() -> u32 {
    2
}
fn default_health_probe_timeout_secs() -> u64 {
    5
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            threshold: default_health_threshold(),
            probe_timeout_secs: default_health_probe_timeout_secs(),
        }
    }
}

/// Usage-to-billing pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_billing_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_billing_min_charge")]
    pub min_charge_amount: i64,
    #[serde(default = "default_usage_queue_max_len")]
    pub usage_queue_max_len: usize,
    #[serde(default = "default_error_queue_max_len")]
    pub error_queue_max_len: usize,
    #[serde(default = "default_balance_probe_ttl_secs")]
    pub balance_probe_ttl_secs: u64,
}

fn default_billing_interval_secs() -> u64 {
    300
}
fn default_billing_min_charge() -> i64 {
    100
}
fn default_usage_queue_max_len() -> usize {
    100_000
}
fn default_error_queue_max_len() -> usize {
    10_000
}
fn default_balance_probe_ttl_secs() -> u64 {
    60
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_billing_interval_secs(),
            min_charge_amount: default_billing_min_charge(),
            usage_queue_max_len: default_usage_queue_max_len(),
            error_queue_max_len: default_error_queue_max_len(),
            balance_probe_ttl_secs: default_balance_probe_ttl_secs(),
        }
    }
}

/// File-upload cleanup job tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCleanupConfig {
    #[serde(default = "default_file_cleanup_interval_secs")]
    pub interval_secs: u64,
    /// Files inactive for longer than this are marked deleted.
    #[serde(default = "default_file_retention_secs")]
    pub retention_secs: u64,
}

fn default_file_cleanup_interval_secs() -> u64 {
    3600
}
fn default_file_retention_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for FileCleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_file_cleanup_interval_secs(),
            retention_secs: default_file_retention_secs(),
        }
    }
}

/// Model names that should have their "thinking" segment split out of the
/// answer body before being relayed to the client.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThinkModelsConfig {
    #[serde(default)]
    pub model_name_patterns: Vec<String>,
}

/// Seed data used to bootstrap the in-memory collaborator stores at
/// startup, standing in for rows a real relational store would hold.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SeedDataConfig {
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
    #[serde(default)]
    pub models: Vec<SeedModel>,
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
    #[serde(default)]
    pub rate_limits: Vec<SeedRateLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedApiKey {
    pub id: String,
    pub creator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedModel {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedChannel {
    pub id: u64,
    pub name: String,
    pub upstream_url: String,
    pub upstream_secret: String,
    #[serde(default)]
    pub model_redirect: std::collections::HashMap<String, String>,
    pub model_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRateLimit {
    pub level: i64,
    pub model_name: String,
    pub rpm: i64,
    pub tpm: i64,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub file_cleanup: FileCleanupConfig,
    #[serde(default)]
    pub think_models: ThinkModelsConfig,
    #[serde(default)]
    pub seed: SeedDataConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8000);
        assert!(config.rate_limiter.fail_open);
        assert!(!config.seed.channels.is_empty());
    }

    #[test]
    fn test_server_config_runtime_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.runtime_worker_threads, None);
        assert_eq!(server.runtime_max_blocking_threads, Some(8));
        assert_eq!(server.runtime_thread_stack_size_kb, None);
    }

    #[test]
    fn test_rate_limiter_defaults_fail_open() {
        assert!(RateLimiterConfig::default().fail_open);
    }
}
