use thiserror::Error;

use crate::model::{DeviceId, MacAddress, ModuleId};

/// Why an outstanding uplink request was cancelled.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum CancelReason {
    /// The session dropped before a response arrived.
    #[display("disconnect")]
    Disconnect,
    /// The connector was stopped.
    #[display("shutdown")]
    Shutdown,
}

/// Errors surfaced by uplink send operations.
///
/// Transport failures are absorbed by the connector's reconnect machinery
/// and never reach callers; what remains is the request-level taxonomy.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("no response within the allowed wait")]
    Timeout,
    #[error("request cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    #[error("context pool is full ({capacity} outstanding requests)")]
    Capacity { capacity: usize },
    #[error("connector is not running")]
    NotRunning,
    #[error("uplink endpoint is invalid")]
    Endpoint(#[from] url::ParseError),
}

/// Errors returned by BLE adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("device {mac} is not known to adapter `{adapter}`")]
    NotFound { adapter: String, mac: MacAddress },
    #[error("failed to change power state of adapter `{adapter}`")]
    PowerTimeout { adapter: String },
    #[error("adapter `{adapter}` is unhealthy after a failed power cycle")]
    Unhealthy { adapter: String },
    #[error("timed out waiting for {operation} on device {mac}")]
    Timeout {
        operation: &'static str,
        mac: MacAddress,
    },
    #[error("bluetooth bus failure: {message}")]
    Io { message: String },
}

impl AdapterError {
    /// Wraps a backend failure message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

/// Errors surfaced to the originator of a downstream command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("device {device} is not known to this manager")]
    NotFound { device: DeviceId },
    #[error("module {module} of device {device} does not react to set-value")]
    InvalidAccess { device: DeviceId, module: ModuleId },
    #[error("device {device} refused the operation in its current state")]
    IllegalState { device: DeviceId },
    #[error("device {device} is already registered")]
    AlreadyRegistered { device: DeviceId },
    #[error(transparent)]
    Upstream(#[from] UplinkError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Errors returned when parsing fake bus fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake scan fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error(transparent)]
    InvalidMac(#[from] crate::model::IdParseError),
}

/// Errors raised while loading or validating gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
    #[error("invalid `{field}`: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },
    #[error("failed to read virtual device definitions")]
    DeviceFileIo(#[source] std::io::Error),
    #[error("failed to parse virtual device definitions")]
    DeviceFileFormat(#[from] toml::de::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Figment(Box::new(error))
    }
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
