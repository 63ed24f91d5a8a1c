//! Configuration system for the BMS ingestor
//!
//! Configuration is read from a TOML file (or built-in defaults), then
//! environment overrides are applied, then the result is validated. Secrets
//! never live in the file: credentials are referenced by environment
//! variable name and resolved at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main ingestor configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestorConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub subscriptions: SubscriptionSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client identifiers are `<prefix>-<random suffix>`, fresh per connect
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing username
    #[serde(default = "default_username_env")]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default = "default_password_env")]
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// QoS used for subscriptions (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_connack_timeout")]
    pub connack_timeout_secs: u64,
    /// Retained online/offline marker topic; also used as the last will
    #[serde(default = "default_status_topic")]
    pub status_topic: Option<String>,
    /// Topic registry snapshots are published to
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
    #[serde(default)]
    pub tls: TlsSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id_prefix: default_client_id_prefix(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            keep_alive_secs: default_keep_alive(),
            qos: default_qos(),
            connack_timeout_secs: default_connack_timeout(),
            status_topic: default_status_topic(),
            control_topic: default_control_topic(),
            tls: TlsSection::default(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "bms-ingestor".to_string()
}

fn default_username_env() -> Option<String> {
    Some("MQTT_USERNAME".to_string())
}

fn default_password_env() -> Option<String> {
    Some("MQTT_PASSWORD".to_string())
}

fn default_keep_alive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_connack_timeout() -> u64 {
    10
}

fn default_status_topic() -> Option<String> {
    Some("ingestor/status".to_string())
}

fn default_control_topic() -> String {
    "bms/control".to_string()
}

/// TLS settings for the broker session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    /// CA bundle; absent means the system trust store
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Disables certificate and hostname verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub version: TlsVersion,
}

/// Accepted TLS protocol selectors. TLS 1.0 and 1.1 are not offered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TlsVersion {
    #[serde(rename = "tlsv1.2")]
    Tls12,
    #[serde(rename = "tlsv1.3")]
    Tls13,
    #[default]
    #[serde(rename = "auto")]
    Auto,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tlsv1.2" | "tls1.2" | "1.2" => Ok(TlsVersion::Tls12),
            "tlsv1.3" | "tls1.3" | "1.3" => Ok(TlsVersion::Tls13),
            "auto" | "" => Ok(TlsVersion::Auto),
            other => Err(ConfigError::InvalidConfig(format!(
                "unsupported TLS version '{other}' (expected tlsv1.2, tlsv1.3 or auto)"
            ))),
        }
    }
}

/// How device topics are subscribed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// One `<base>/<device_id>` subscription per registry entry
    #[default]
    PerDevice,
    /// A single `<base>/#` subscription
    Wildcard,
}

impl SubscriptionMode {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_device" | "device" => Ok(SubscriptionMode::PerDevice),
            "wildcard" => Ok(SubscriptionMode::Wildcard),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown subscription mode '{other}'"
            ))),
        }
    }
}

/// Where the classifier takes the device identifier from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdSource {
    #[default]
    Topic,
    PayloadThenTopic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    #[serde(default)]
    pub mode: SubscriptionMode,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Topics subscribed regardless of registry contents
    #[serde(default)]
    pub static_topics: Vec<String>,
    #[serde(default)]
    pub device_id_source: DeviceIdSource,
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            mode: SubscriptionMode::default(),
            base_topic: default_base_topic(),
            static_topics: Vec::new(),
            device_id_source: DeviceIdSource::default(),
        }
    }
}

fn default_base_topic() -> String {
    "bms/telemetry".to_string()
}

/// Storage service (PostgREST) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// Base URL; if empty, resolved from `url_env`
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_storage_url_env")]
    pub url_env: String,
    /// Environment variable containing the service key
    #[serde(default = "default_storage_key_env")]
    pub key_env: String,
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tables: TableNames,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            url_env: default_storage_url_env(),
            key_env: default_storage_key_env(),
            timeout_secs: default_storage_timeout(),
            tables: TableNames::default(),
        }
    }
}

fn default_storage_url_env() -> String {
    "SUPABASE_URL".to_string()
}

fn default_storage_key_env() -> String {
    "SUPABASE_KEY".to_string()
}

fn default_storage_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TableNames {
    pub telemetry: String,
    pub alerts: String,
    pub device_status: String,
    pub raw_messages: String,
    pub registry: String,
    /// Column holding the device identifier in the registry table
    pub registry_key: String,
    /// Column used to order "latest" reads
    pub order_column: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            telemetry: "battery_cell_data".to_string(),
            alerts: "alerts".to_string(),
            device_status: "device_status".to_string(),
            raw_messages: "raw_messages".to_string(),
            registry: "battery_pack_info".to_string(),
            registry_key: "packsn".to_string(),
            order_column: "created_at".to_string(),
        }
    }
}

/// Periodic task and pacing intervals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingSection {
    pub health_check_interval_secs: u64,
    /// Bounded wait before the health monitor retries a connect
    pub reconnect_wait_ms: u64,
    /// Minimum spacing between subscribe/publish calls on the session
    pub call_spacing_ms: u64,
    /// Minimum spacing between snapshot publishes
    pub publish_spacing_ms: u64,
    pub shutdown_grace_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            reconnect_wait_ms: 1000,
            call_spacing_ms: 100,
            publish_spacing_ms: 500,
            shutdown_grace_secs: 5,
            stats_interval_secs: 60,
        }
    }
}

impl TimingSection {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn call_spacing(&self) -> Duration {
        Duration::from_millis(self.call_spacing_ms)
    }

    pub fn publish_spacing(&self) -> Duration {
        Duration::from_millis(self.publish_spacing_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// Reconnect backoff bounds for one burst of connect attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub backoff_pattern_ms: Vec<u64>,
    pub sustained_delay_ms: u64,
    /// Attempts per burst (None = keep retrying)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_pattern_ms: vec![1000, 2000, 5000, 10000],
            sustained_delay_ms: 30000,
            max_attempts: Some(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub workers: usize,
    /// Queue depth per worker
    pub queue_capacity: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Port for the HTTP health server; disabled when absent
    pub port: Option<u16>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Default config file locations tried when `--config` is not given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["ingestor.toml", "config/ingestor.toml"];

impl IngestorConfig {
    /// Load configuration from a TOML file without applying overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: IngestorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the effective configuration: file (or defaults), then
    /// process environment overrides, then validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match DEFAULT_CONFIG_PATHS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(found) => Self::load_from_file(found)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides from any lookup function
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host.trim().to_string();
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_override("MQTT_PORT", &port)?;
        }
        if let Some(topics) = lookup("MQTT_TOPICS") {
            self.subscriptions.static_topics = parse_topic_list(&topics);
        }
        if let Some(enabled) = lookup("MQTT_USE_TLS") {
            self.mqtt.tls.enabled = parse_bool("MQTT_USE_TLS", &enabled)?;
        }
        if let Some(path) = lookup("MQTT_TLS_CA_CERT") {
            self.mqtt.tls.ca_cert_path = non_empty_path(&path);
        }
        if let Some(path) = lookup("MQTT_TLS_CERTFILE") {
            self.mqtt.tls.client_cert_path = non_empty_path(&path);
        }
        if let Some(path) = lookup("MQTT_TLS_KEYFILE") {
            self.mqtt.tls.client_key_path = non_empty_path(&path);
        }
        if let Some(insecure) = lookup("MQTT_TLS_INSECURE") {
            self.mqtt.tls.insecure = parse_bool("MQTT_TLS_INSECURE", &insecure)?;
        }
        if let Some(version) = lookup("MQTT_TLS_VERSION") {
            self.mqtt.tls.version = TlsVersion::parse(&version)?;
        }
        if let Some(url) = lookup(&self.storage.url_env) {
            self.storage.url = url.trim().to_string();
        }
        if let Some(mode) = lookup("SUBSCRIPTION_MODE") {
            self.subscriptions.mode = SubscriptionMode::parse(&mode)?;
        }
        if let Some(base) = lookup("SUBSCRIPTION_BASE_TOPIC") {
            self.subscriptions.base_topic = base.trim().to_string();
        }
        if let Some(interval) = lookup("HEALTH_CHECK_INTERVAL") {
            self.timing.health_check_interval_secs =
                parse_override("HEALTH_CHECK_INTERVAL", &interval)?;
        }
        Ok(())
    }

    /// Validate the configuration; failures here are fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("mqtt.host is empty".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig("mqtt.port must be > 0".to_string()));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        if self.mqtt.control_topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.control_topic is empty".to_string(),
            ));
        }
        if self.subscriptions.base_topic.trim().trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidConfig(
                "subscriptions.base_topic is empty".to_string(),
            ));
        }
        if self.storage.url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "storage URL missing: set storage.url or {}",
                self.storage.url_env
            )));
        }
        Url::parse(&self.storage.url).map_err(|e| {
            ConfigError::InvalidConfig(format!("storage URL '{}' is invalid: {e}", self.storage.url))
        })?;
        if self.pipeline.workers == 0 || self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "pipeline.workers and pipeline.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.timing.health_check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "timing.health_check_interval_secs must be > 0".to_string(),
            ));
        }
        if self.mqtt.tls.enabled {
            let tls = &self.mqtt.tls;
            for path in [&tls.ca_cert_path, &tls.client_cert_path, &tls.client_key_path]
                .into_iter()
                .flatten()
            {
                if !path.exists() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "TLS file not found: {}",
                        path.display()
                    )));
                }
            }
            if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "client certificate and key must be configured together".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
            .filter(|value| !value.is_empty())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get the storage service key; missing key is a fatal startup error
    pub fn get_storage_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.storage.key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::EnvVarNotFound(self.storage.key_env.clone()))
    }

    /// Human-readable summary with secrets masked
    pub fn display_lines(&self) -> Vec<String> {
        let tls = &self.mqtt.tls;
        let password = self.get_mqtt_password();
        let storage_key = std::env::var(&self.storage.key_env).ok();
        vec![
            format!("MQTT_HOST: {}", self.mqtt.host),
            format!("MQTT_PORT: {}", self.mqtt.port),
            format!(
                "MQTT_USERNAME: {}",
                self.get_mqtt_username().unwrap_or_else(|| "Not set".to_string())
            ),
            format!("MQTT_PASSWORD: {}", mask_secret(password.as_deref())),
            format!("MQTT_USE_TLS: {}", tls.enabled),
            format!("MQTT_TLS_INSECURE: {}", tls.insecure),
            format!("MQTT_TLS_VERSION: {:?}", tls.version),
            format!(
                "MQTT_TLS_CA_CERT: {}",
                tls.ca_cert_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "system trust store".to_string())
            ),
            format!("SUBSCRIPTION_MODE: {:?}", self.subscriptions.mode),
            format!("SUBSCRIPTION_BASE_TOPIC: {}", self.subscriptions.base_topic),
            format!("MQTT_TOPICS: {}", self.subscriptions.static_topics.join(",")),
            format!("CONTROL_TOPIC: {}", self.mqtt.control_topic),
            format!("SUPABASE_URL: {}", self.storage.url),
            format!("SUPABASE_KEY: {}", mask_secret(storage_key.as_deref())),
            format!(
                "HEALTH_CHECK_INTERVAL: {}s",
                self.timing.health_check_interval_secs
            ),
            format!("CALL_SPACING: {}ms", self.timing.call_spacing_ms),
        ]
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let mut config = Self::default();
        config.storage.url = "http://localhost:54321".to_string();
        config
    }
}

/// Split a topic list on `,` or `;`, trimming entries and dropping empties
pub fn parse_topic_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

/// Mask a secret down to its last four characters
pub fn mask_secret(value: Option<&str>) -> String {
    match value {
        None | Some("") => "Not set".to_string(),
        Some(secret) => {
            let chars: Vec<char> = secret.chars().collect();
            if chars.len() <= 4 {
                "****".to_string()
            } else {
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("****{tail}")
            }
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}
