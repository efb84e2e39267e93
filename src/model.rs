use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Driver family occupying the top byte of a [`DeviceId`].
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DevicePrefix {
    VirtualDevice,
    BluetoothLe,
    BluetoothClassic,
    SubGhz,
}

impl DevicePrefix {
    /// Returns the raw prefix byte stored in device identifiers.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::VirtualDevice => 0xa3,
            Self::BluetoothLe => 0xa4,
            Self::BluetoothClassic => 0xa5,
            Self::SubGhz => 0xa6,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0xa3 => Some(Self::VirtualDevice),
            0xa4 => Some(Self::BluetoothLe),
            0xa5 => Some(Self::BluetoothClassic),
            0xa6 => Some(Self::SubGhz),
            _ => None,
        }
    }
}

/// Errors returned when parsing identifiers out of their textual form.
#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("device id `{value}` is not a 64-bit hexadecimal number")]
    InvalidDeviceId { value: String },
    #[error("device id carries unknown prefix byte {prefix:#04x}")]
    UnknownPrefix { prefix: u8 },
    #[error("MAC address `{value}` is not six hexadecimal octets")]
    InvalidMac { value: String },
    #[error(transparent)]
    InvalidDigit(#[from] ParseIntError),
}

/// 64-bit opaque device identifier: one prefix byte plus a 7-byte ident.
///
/// Equality and hashing cover the full 64 bits; the prefix selects the
/// driver family responsible for the device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Builds an identifier from a family prefix and a 56-bit ident.
    #[must_use]
    pub fn new(prefix: DevicePrefix, ident: u64) -> Self {
        Self((u64::from(prefix.raw()) << 56) | (ident & 0x00ff_ffff_ffff_ffff))
    }

    /// Returns the driver family this identifier belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`IdParseError::UnknownPrefix`] when the top byte does not
    /// name a known family.
    pub fn prefix(self) -> Result<DevicePrefix, IdParseError> {
        let raw = (self.0 >> 56) as u8;
        DevicePrefix::from_raw(raw).ok_or(IdParseError::UnknownPrefix { prefix: raw })
    }

    /// Returns whether this identifier belongs to the given family.
    #[must_use]
    pub fn has_prefix(self, prefix: DevicePrefix) -> bool {
        (self.0 >> 56) as u8 == prefix.raw()
    }

    /// Returns the 56-bit ident without the prefix byte.
    #[must_use]
    pub fn ident(self) -> u64 {
        self.0 & 0x00ff_ffff_ffff_ffff
    }

    /// Returns the full 64-bit value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rewrites the prefix byte, keeping the ident.
    #[must_use]
    pub fn with_prefix(self, prefix: DevicePrefix) -> Self {
        Self::new(prefix, self.ident())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        let raw = u64::from_str_radix(digits, 16).map_err(|_| IdParseError::InvalidDeviceId {
            value: value.to_string(),
        })?;
        Ok(Self(raw))
    }
}

impl From<u64> for DeviceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 48-bit Bluetooth hardware address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct MacAddress(u64);

impl MacAddress {
    /// Builds an address from six octets, most significant first.
    #[must_use]
    pub fn from_octets(octets: [u8; 6]) -> Self {
        let mut value = 0u64;
        for octet in octets {
            value = (value << 8) | u64::from(octet);
        }
        Self(value)
    }

    /// Returns the six octets, most significant first.
    #[must_use]
    pub fn octets(self) -> [u8; 6] {
        let mut octets = [0u8; 6];
        for (index, octet) in octets.iter_mut().enumerate() {
            *octet = (self.0 >> (8 * (5 - index))) as u8;
        }
        octets
    }

    /// Formats the address with an arbitrary separator, e.g. for bus paths.
    #[must_use]
    pub fn to_separated_string(self, separator: char) -> String {
        let mut formatted = String::with_capacity(17);
        for (index, octet) in self.octets().into_iter().enumerate() {
            if index > 0 {
                formatted.push(separator);
            }
            formatted.push_str(&format!("{octet:02X}"));
        }
        formatted
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_separated_string(':'))
    }
}

impl FromStr for MacAddress {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = value.split([':', '_', '-']).collect();
        if octets.len() != 6 {
            return Err(IdParseError::InvalidMac {
                value: value.to_string(),
            });
        }

        let mut parsed = [0u8; 6];
        for (slot, octet) in parsed.iter_mut().zip(octets) {
            *slot = u8::from_str_radix(octet, 16).map_err(|_| IdParseError::InvalidMac {
                value: value.to_string(),
            })?;
        }
        Ok(Self::from_octets(parsed))
    }
}

/// Position of a module within its device, dense from zero.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ModuleId(u16);

impl ModuleId {
    /// Creates a module position.
    #[must_use]
    pub fn new(index: u16) -> Self {
        Self(index)
    }

    /// Returns the raw position.
    #[must_use]
    pub fn index(self) -> u16 {
        self.0
    }
}

/// Sensor or actuator kind of a module.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Availability,
    Battery,
    Brightness,
    CarbonDioxide,
    Humidity,
    Luminance,
    Motion,
    OnOff,
    Pressure,
    Rssi,
    Security,
    Temperature,
}

/// Attribute flag refining a module kind.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModuleAttribute {
    Inner,
    Outer,
    Controllable,
}

/// Enumerated module kind plus attribute flags.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleType {
    kind: ModuleKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<ModuleAttribute>,
}

impl ModuleType {
    /// Creates a module type without attributes.
    #[must_use]
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            attributes: Vec::new(),
        }
    }

    /// Adds attribute flags, deduplicated and ordered.
    #[must_use]
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = ModuleAttribute>) -> Self {
        self.attributes.extend(attributes);
        self.attributes.sort_unstable();
        self.attributes.dedup();
        self
    }

    /// Returns the module kind.
    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Returns the attribute flags.
    #[must_use]
    pub fn attributes(&self) -> &[ModuleAttribute] {
        &self.attributes
    }

    /// Returns whether the module accepts downstream set-value commands.
    #[must_use]
    pub fn is_controllable(&self) -> bool {
        self.attributes.contains(&ModuleAttribute::Controllable)
    }
}

/// How a module reacts to a downstream set-value command.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    #[default]
    None,
    Success,
    Failure,
}

/// Poll cadence of a device: event-driven only, or a fixed period of at
/// least one second.
#[derive(Debug, Clone, Copy, Eq, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub enum RefreshTime {
    None,
    Every(Duration),
}

impl RefreshTime {
    /// Builds a periodic refresh, clamping sub-second periods up to 1 s.
    #[must_use]
    pub fn from_secs(seconds: u64) -> Self {
        Self::Every(Duration::from_secs(seconds.max(1)))
    }

    /// Returns the period, if the device is polled at all.
    #[must_use]
    pub fn period(self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Every(period) => Some(period),
        }
    }

    /// Returns whether the device is event-driven only.
    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for RefreshTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Every(period) => write!(f, "{}", period.as_secs()),
        }
    }
}

impl FromStr for RefreshTime {
    type Err = ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        Ok(Self::from_secs(value.parse::<u64>()?))
    }
}

/// Immutable description of a discovered device, announced upstream when
/// the device is offered for pairing.
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
pub struct DeviceDescription {
    id: DeviceId,
    #[builder(into)]
    vendor: String,
    #[builder(into)]
    product: String,
    modules: Vec<ModuleType>,
    refresh_time: Option<RefreshTime>,
}

impl DeviceDescription {
    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Returns the vendor name.
    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Returns the product name.
    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Returns the module types ordered by module position.
    #[must_use]
    pub fn modules(&self) -> &[ModuleType] {
        &self.modules
    }

    /// Returns the refresh cadence, when the device advertises one.
    #[must_use]
    pub fn refresh_time(&self) -> Option<RefreshTime> {
        self.refresh_time
    }
}

/// One sampled module value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleValue {
    pub module: ModuleId,
    pub value: f64,
}

/// A batch of readings produced by one device poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub device_id: DeviceId,
    pub values: Vec<ModuleValue>,
}

impl SensorData {
    /// Creates a reading batch for a device.
    #[must_use]
    pub fn new(device_id: DeviceId, values: Vec<ModuleValue>) -> Self {
        Self { device_id, values }
    }
}
