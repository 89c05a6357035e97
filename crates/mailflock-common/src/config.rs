//! Configuration for Mailflock

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of destinations the mail provider accepts in one bulk call
pub const PROVIDER_BULK_LIMIT: usize = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Campaign dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Unsubscribe link signing
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,

    /// Topic names used for fan-out
    #[serde(default)]
    pub topics: TopicConfig,

    /// Scheduled campaign poller
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Report export storage
    #[serde(default)]
    pub reports: ReportConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Campaign dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Recipients per bulk-send message; never above [`PROVIDER_BULK_LIMIT`]
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Seconds between polls of the campaigns topic when it is empty
    #[serde(default = "default_campaigner_poll")]
    pub poll_interval_secs: u64,

    /// SES configuration set attached to bulk sends, if the account has one
    pub configuration_set: Option<String>,

    /// Seconds between lease renewals of the campaigns message being sent;
    /// keep well under the topic queue lease
    #[serde(default = "default_lease_renew")]
    pub lease_renew_secs: u64,
}

impl DispatchConfig {
    /// Batch limit clamped to the provider ceiling
    pub fn effective_batch_limit(&self) -> usize {
        match self.batch_limit {
            0 => PROVIDER_BULK_LIMIT,
            n => n.min(PROVIDER_BULK_LIMIT),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            poll_interval_secs: default_campaigner_poll(),
            configuration_set: None,
            lease_renew_secs: default_lease_renew(),
        }
    }
}

fn default_batch_limit() -> usize {
    PROVIDER_BULK_LIMIT
}

fn default_campaigner_poll() -> u64 {
    5
}

fn default_lease_renew() -> u64 {
    60
}

/// Unsubscribe link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    /// HMAC secret; an empty secret makes token generation fail
    #[serde(default)]
    pub secret: String,

    /// Public base URL of the application serving the unsubscribe page
    #[serde(default = "default_app_url")]
    pub app_url: String,
}

impl Default for UnsubscribeConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            app_url: default_app_url(),
        }
    }
}

fn default_app_url() -> String {
    "http://localhost:8080".to_string()
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_campaigns_topic")]
    pub campaigns: String,

    #[serde(default = "default_send_bulk_topic")]
    pub send_bulk: String,

    #[serde(default = "default_exports_topic")]
    pub exports: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            campaigns: default_campaigns_topic(),
            send_bulk: default_send_bulk_topic(),
            exports: default_exports_topic(),
        }
    }
}

fn default_campaigns_topic() -> String {
    "campaigns".to_string()
}

fn default_send_bulk_topic() -> String {
    "send_bulk".to_string()
}

fn default_exports_topic() -> String {
    "exports".to_string()
}

/// Scheduled campaign poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the poller in the server binary
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Seconds between polls
    #[serde(default = "default_scheduler_poll")]
    pub poll_interval_secs: u64,

    /// Maximum due schedules fired per poll
    #[serde(default = "default_scheduler_batch")]
    pub batch_size: i64,

    /// Seconds a claimed schedule stays hidden from other pollers
    #[serde(default = "default_scheduler_claim_lease")]
    pub claim_lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval_secs: default_scheduler_poll(),
            batch_size: default_scheduler_batch(),
            claim_lease_secs: default_scheduler_claim_lease(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_poll() -> u64 {
    30
}

fn default_scheduler_batch() -> i64 {
    100
}

fn default_scheduler_claim_lease() -> u64 {
    300
}

/// Report export storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Base directory for exported report files
    #[serde(default = "default_report_path")]
    pub path: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            path: default_report_path(),
        }
    }
}

fn default_report_path() -> PathBuf {
    PathBuf::from("/var/lib/mailflock/reports")
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default file locations, then apply
    /// `MAILFLOCK__SECTION__KEY` environment overrides.
    pub fn load() -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("/etc/mailflock/config").required(false))
            .add_source(config::File::with_name("./config").required(false))
            .add_source(
                config::Environment::with_prefix("MAILFLOCK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to load configuration: {}", e)))?;

        settings
            .try_deserialize::<Config>()
            .map_err(|e| crate::Error::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_sections() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.batch_limit, 1000);

        let topics = TopicConfig::default();
        assert_eq!(topics.campaigns, "campaigns");
        assert_eq!(topics.send_bulk, "send_bulk");

        assert!(UnsubscribeConfig::default().secret.is_empty());
    }

    #[test]
    fn test_batch_limit_is_clamped() {
        let mut dispatch = DispatchConfig::default();
        dispatch.batch_limit = 5000;
        assert_eq!(dispatch.effective_batch_limit(), 1000);

        dispatch.batch_limit = 0;
        assert_eq!(dispatch.effective_batch_limit(), 1000);

        dispatch.batch_limit = 250;
        assert_eq!(dispatch.effective_batch_limit(), 250);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/mailflock"
max_connections = 8

[dispatch]
batch_limit = 500
configuration_set = "mailflock"

[unsubscribe]
secret = "s3cr3t"
app_url = "https://app.example.com"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/mailflock")
        );
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.database.min_connections, 5);
        assert_eq!(config.dispatch.batch_limit, 500);
        assert_eq!(config.unsubscribe.secret, "s3cr3t");
        assert_eq!(config.topics.send_bulk, "send_bulk");
        assert_eq!(config.logging.level, "info");
    }
}
