//! Gateway configuration: a TOML profile with `FIELDGATE_` environment
//! overrides, validated into the timeouts and endpoints the runtime uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "FIELDGATE_";

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Gateway identity advertised during registration.
    #[serde(default)]
    pub gateway: IdentityConfig,
    /// Persistent uplink session settings.
    #[serde(default)]
    pub uplink: UplinkConfig,
    /// BLE presence policy and adapter selection.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    /// Log output settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Optional TOML file with virtual device definitions.
    #[serde(default)]
    pub virtual_devices: Option<PathBuf>,
}

impl GatewayConfig {
    /// Loads configuration from a TOML file merged with environment
    /// overrides (`FIELDGATE_UPLINK__HOST=...`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be parsed or a value
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.uplink.validate()?;
        self.bluetooth.validate()
    }
}

/// Identity the gateway registers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Stable gateway identifier known to the server.
    pub id: String,
    /// Reported software version.
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: "fieldgate".to_string(),
            version: default_version(),
        }
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Settings of the persistent WebSocket uplink.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Largest accepted incoming frame, in bytes.
    pub max_message_size: usize,
    /// Socket readability poll period of the receiver.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_timeout: Duration,
    /// Wait for a registration acknowledgement.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub receive_timeout: Duration,
    /// Bound on a single request/response exchange.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub send_timeout: Duration,
    /// Pause between failed connection attempts.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_connect_timeout: Duration,
    /// Idle period after which the sender probes with a ping.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub busy_sleep: Duration,
    /// Age beyond which unsent or unanswered messages are abandoned.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub resend_timeout: Duration,
    /// Outstanding request/response contexts kept at once.
    pub context_capacity: usize,
    /// Outbound messages buffered between sessions.
    pub queue_capacity: usize,
    /// Optional TLS wrapping of the WebSocket.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8850,
            max_message_size: 64 * 1024,
            poll_timeout: Duration::from_millis(250),
            receive_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(5),
            retry_connect_timeout: Duration::from_secs(10),
            busy_sleep: Duration::from_secs(15),
            resend_timeout: Duration::from_secs(20),
            context_capacity: 64,
            queue_capacity: 256,
            tls: None,
        }
    }
}

impl UplinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Validation {
                field: "uplink.port",
                reason: "port must be non-zero".to_string(),
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation {
                field: "uplink.max_message_size",
                reason: "receive buffer cannot be empty".to_string(),
            });
        }
        if self.context_capacity == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::Validation {
                field: "uplink.context_capacity",
                reason: "capacities must be non-zero".to_string(),
            });
        }
        if self.resend_timeout < self.busy_sleep {
            return Err(ConfigError::Validation {
                field: "uplink.resend_timeout",
                reason: "resend timeout must cover at least one busy sleep".to_string(),
            });
        }
        Ok(())
    }
}

/// TLS client settings for the uplink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM bundle with additional trusted roots.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// PKCS#12 archive carrying the client certificate and key.
    #[serde(default)]
    pub client_identity: Option<PathBuf>,
    /// Password protecting the PKCS#12 archive.
    #[serde(default)]
    pub identity_password: Option<String>,
    /// Disables certificate verification for self-signed servers.
    #[serde(default)]
    pub danger_accept_invalid: bool,
}

/// Rendering of the log stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Pretty on a terminal, JSON otherwise.
    #[default]
    Auto,
    Pretty,
    Json,
}

/// Log output settings; `RUST_LOG` still overrides the level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_level: String,
    /// Log rendering.
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            format: LogFormat::Auto,
        }
    }
}

/// BLE adapter selection and presence policy.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BluetoothConfig {
    /// Adapter name, e.g. `hci0`.
    pub adapter: String,
    /// Window within which an RSSI update keeps an LE device visible.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub le_max_age_rssi: Duration,
    /// Inactivity after which an unwatched LE device record is removed.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub le_max_unavailability_time: Duration,
    /// Window within which a missed classic device still counts as present.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub classic_artificial_availability_timeout: Duration,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            le_max_age_rssi: Duration::from_secs(30),
            le_max_unavailability_time: Duration::from_secs(7 * 24 * 60 * 60),
            classic_artificial_availability_timeout: Duration::from_secs(30),
        }
    }
}

impl BluetoothConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("bluetooth.le_max_age_rssi", self.le_max_age_rssi),
            (
                "bluetooth.le_max_unavailability_time",
                self.le_max_unavailability_time,
            ),
            (
                "bluetooth.classic_artificial_availability_timeout",
                self.classic_artificial_availability_timeout,
            ),
        ] {
            if value < Duration::from_secs(1) {
                return Err(ConfigError::Validation {
                    field,
                    reason: "must be at least a second".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn from_toml(raw: &str) -> Result<GatewayConfig, ConfigError> {
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::string(raw))
            .extract()
            .map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_follow_presence_policy() {
        let config = GatewayConfig::default();

        assert_eq!(Duration::from_secs(30), config.bluetooth.le_max_age_rssi);
        assert_eq!(
            Duration::from_secs(7 * 24 * 60 * 60),
            config.bluetooth.le_max_unavailability_time
        );
        assert_eq!(
            Duration::from_secs(30),
            config.bluetooth.classic_artificial_availability_timeout
        );
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let config = from_toml(
            r#"
            [gateway]
            id = "gw-0042"

            [uplink]
            host = "cloud.example.net"
            port = 443
            busy_sleep = 5.0
            resend_timeout = 12.5
            "#,
        )
        .expect("config should load");

        assert_eq!("gw-0042", config.gateway.id);
        assert_eq!("cloud.example.net", config.uplink.host);
        assert_eq!(443, config.uplink.port);
        assert_eq!(Duration::from_millis(12_500), config.uplink.resend_timeout);
        assert_eq!("hci0", config.bluetooth.adapter);
    }

    #[test]
    fn telemetry_section_overrides_level_and_format() {
        let config = from_toml(
            r#"
            [telemetry]
            default_level = "fieldgate=debug,warn"
            format = "json"
            "#,
        )
        .expect("config should load");

        assert_eq!("fieldgate=debug,warn", config.telemetry.default_level);
        assert_eq!(LogFormat::Json, config.telemetry.format);

        let defaults = GatewayConfig::default();
        assert_eq!("info", defaults.telemetry.default_level);
        assert_eq!(LogFormat::Auto, defaults.telemetry.format);
    }

    #[test]
    fn sub_second_presence_windows_are_rejected() {
        let result = from_toml(
            r#"
            [bluetooth]
            adapter = "hci1"
            le_max_age_rssi = 0.2
            le_max_unavailability_time = 604800
            classic_artificial_availability_timeout = 30
            "#,
        );

        assert_matches!(
            result,
            Err(ConfigError::Validation {
                field: "bluetooth.le_max_age_rssi",
                ..
            })
        );
    }

    #[test]
    fn resend_timeout_must_cover_busy_sleep() {
        let result = from_toml(
            r#"
            [uplink]
            busy_sleep = 30
            resend_timeout = 10
            "#,
        );

        assert_matches!(
            result,
            Err(ConfigError::Validation {
                field: "uplink.resend_timeout",
                ..
            })
        );
    }
}
