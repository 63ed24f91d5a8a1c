//! Session settings and rumqttc option construction
//!
//! Everything here is pure: settings are resolved once at startup and a
//! fresh `MqttOptions` (with a fresh client id) is built for every connect.

use crate::config::IngestorConfig;
use crate::transport::mqtt::tls::{build_tls_transport, TlsSetupError};
use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use uuid::Uuid;

/// Payload of the retained status marker while the ingestor is up
pub const STATUS_ONLINE: &str = "online";
/// Payload of the retained status marker (and last will) when it is down
pub const STATUS_OFFLINE: &str = "offline";

/// Credentials resolved from the environment at startup
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a session needs to (re)connect
#[derive(Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connack_timeout: Duration,
    pub call_spacing: Duration,
    /// Topic for the retained online/offline marker and last will
    pub status_topic: Option<String>,
    pub tls: Option<RumqttcTransport>,
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id_prefix", &self.client_id_prefix)
            .field("credentials", &self.credentials)
            .field("keep_alive", &self.keep_alive)
            .field("status_topic", &self.status_topic)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl SessionSettings {
    /// Resolve session settings from configuration; TLS material is loaded
    /// here so that misconfiguration fails at startup.
    pub fn from_config(config: &IngestorConfig) -> Result<Self, TlsSetupError> {
        let credentials = config.get_mqtt_username().map(|username| Credentials {
            username,
            password: config.get_mqtt_password().unwrap_or_default(),
        });
        let tls = if config.mqtt.tls.enabled {
            Some(build_tls_transport(&config.mqtt.tls)?)
        } else {
            None
        };

        Ok(Self {
            host: config.mqtt.host.clone(),
            port: config.mqtt.port,
            client_id_prefix: config.mqtt.client_id_prefix.clone(),
            credentials,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            connack_timeout: Duration::from_secs(config.mqtt.connack_timeout_secs),
            call_spacing: config.timing.call_spacing(),
            status_topic: config.mqtt.status_topic.clone(),
            tls,
        })
    }

    /// Plain-TCP settings, handy for tests and local brokers
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id_prefix: "bms-ingestor".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connack_timeout: Duration::from_secs(10),
            call_spacing: Duration::from_millis(100),
            status_topic: None,
            tls: None,
        }
    }
}

/// Unique client id per connection attempt to prevent broker session takeover
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..12])
}

/// Pure function to configure MQTT options from session settings
pub fn configure_mqtt_options(settings: &SessionSettings) -> Result<MqttOptions, TransportError> {
    if settings.host.trim().is_empty() {
        return Err(TransportError::InvalidOptions("broker host is empty".to_string()));
    }
    if settings.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(
            "keep alive must be at least one second".to_string(),
        ));
    }

    let client_id = generate_client_id(&settings.client_id_prefix);
    let mut mqtt_options = MqttOptions::new(client_id, settings.host.clone(), settings.port);

    if let Some(transport) = &settings.tls {
        mqtt_options.set_transport(transport.clone());
    }

    if let Some(credentials) = &settings.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    if let Some(status_topic) = &settings.status_topic {
        let lwt = LastWill::new(status_topic, STATUS_OFFLINE, QoS::AtLeastOnce, true, None);
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_mqtt_options() {
        let mut settings = SessionSettings::plain("localhost", 1883);
        settings.status_topic = Some("ingestor/status".to_string());
        settings.credentials = Some(Credentials {
            username: "ingestor".to_string(),
            password: "pw".to_string(),
        });

        let options = configure_mqtt_options(&settings).unwrap();

        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.client_id().starts_with("bms-ingestor-"));
    }

    #[test]
    fn test_empty_host_rejected() {
        let settings = SessionSettings::plain("  ", 1883);
        assert!(matches!(
            configure_mqtt_options(&settings),
            Err(TransportError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = generate_client_id("bms");
        let b = generate_client_id("bms");
        assert_ne!(a, b);
        assert!(a.starts_with("bms-"));
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_settings_from_default_config() {
        let mut config = IngestorConfig::test_config();
        config.mqtt.username_env = None;

        let settings = SessionSettings::from_config(&config).unwrap();

        assert!(settings.tls.is_none());
        assert!(settings.credentials.is_none());
        assert_eq!(settings.status_topic.as_deref(), Some("ingestor/status"));
    }
}
