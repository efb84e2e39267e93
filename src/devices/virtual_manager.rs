//! Synthetic devices exercising the full pipeline without hardware.
//!
//! Definitions come from a TOML file; each module carries a value
//! generator and a reaction deciding how set-value commands are treated.

use std::f64::consts::TAU;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::GatewayDevice;
use super::cache::DeviceCache;
use super::manager::{DeviceManager, DeviceManagerCore, ServerCommand};
use super::poller::Distributor;
use crate::error::{CommandError, ConfigError};
use crate::model::{
    DeviceId, DevicePrefix, ModuleAttribute, ModuleId, ModuleKind, ModuleType, ModuleValue,
    Reaction, RefreshTime, SensorData,
};
use crate::uplink::Upstream;

const DEFAULT_REFRESH_SECS: u64 = 30;
const SINE_PERIOD: Duration = Duration::from_secs(60);

/// How a virtual module produces values.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Generator {
    /// Holds the last written value.
    None,
    /// Uniform draw from the module range.
    Random,
    /// Sine sweep over the module range.
    Sine,
    /// Fixed value.
    Constant(f64),
}

impl FromStr for Generator {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" | "none" => Ok(Self::None),
            "random" => Ok(Self::Random),
            "sine" => Ok(Self::Sine),
            other => other.parse::<f64>().map(Self::Constant).map_err(|_| {
                ConfigError::Validation {
                    field: "module.generator",
                    reason: format!("unknown generator `{other}`"),
                }
            }),
        }
    }
}

#[derive(Debug)]
struct VirtualModule {
    module_id: ModuleId,
    module_type: ModuleType,
    min: f64,
    max: f64,
    generator: Generator,
    reaction: Reaction,
    value: Mutex<f64>,
}

impl VirtualModule {
    fn generate(&self, elapsed: Duration) -> f64 {
        match self.generator {
            Generator::None => *self.value.lock().expect("module value lock poisoned"),
            Generator::Random => {
                if self.max <= self.min {
                    self.min
                } else {
                    rand::rng().random_range(self.min..=self.max)
                }
            }
            Generator::Sine => {
                let phase = elapsed.as_secs_f64() / SINE_PERIOD.as_secs_f64() * TAU;
                let amplitude = (self.max - self.min) / 2.0;
                self.min + amplitude * (1.0 + phase.sin())
            }
            Generator::Constant(value) => value.clamp(self.min, self.max),
        }
    }
}

/// One synthetic device built from configuration.
pub struct VirtualDevice {
    id: DeviceId,
    vendor: String,
    product: String,
    refresh: RefreshTime,
    started_at: Instant,
    modules: Vec<VirtualModule>,
}

#[async_trait]
impl GatewayDevice for VirtualDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn vendor(&self) -> &str {
        &self.vendor
    }

    fn product(&self) -> &str {
        &self.product
    }

    fn module_types(&self) -> Vec<ModuleType> {
        self.modules
            .iter()
            .map(|module| module.module_type.clone())
            .collect()
    }

    fn refresh(&self) -> RefreshTime {
        self.refresh
    }

    fn reaction_of(&self, module: ModuleId) -> Option<Reaction> {
        self.modules
            .iter()
            .find(|candidate| candidate.module_id == module)
            .map(|candidate| candidate.reaction)
    }

    async fn poll(&self) -> Result<SensorData, CommandError> {
        let elapsed = self.started_at.elapsed();
        let values = self
            .modules
            .iter()
            .map(|module| ModuleValue {
                module: module.module_id,
                value: module.generate(elapsed),
            })
            .collect();
        Ok(SensorData::new(self.id, values))
    }

    async fn modify_value(&self, module: ModuleId, value: f64) -> Result<(), CommandError> {
        let Some(target) = self
            .modules
            .iter()
            .find(|candidate| candidate.module_id == module)
        else {
            return Err(CommandError::InvalidAccess {
                device: self.id,
                module,
            });
        };

        match target.reaction {
            Reaction::None => Err(CommandError::InvalidAccess {
                device: self.id,
                module,
            }),
            Reaction::Failure => Err(CommandError::IllegalState { device: self.id }),
            Reaction::Success => {
                *target.value.lock().expect("module value lock poisoned") = value;
                Ok(())
            }
        }
    }
}

// ── Configuration schema ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VirtualDevicesFile {
    #[serde(default = "default_true")]
    request_device_list: bool,
    #[serde(default, rename = "device")]
    devices: Vec<DeviceEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceEntry {
    #[serde(default = "default_true")]
    enable: bool,
    id: DeviceId,
    vendor: String,
    product: String,
    #[serde(default)]
    refresh: Option<u64>,
    #[serde(default)]
    paired: bool,
    #[serde(default, rename = "module")]
    modules: Vec<ModuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleEntry {
    #[serde(rename = "type")]
    kind: ModuleKind,
    #[serde(default)]
    attributes: Vec<ModuleAttribute>,
    #[serde(default)]
    min: f64,
    #[serde(default = "default_max")]
    max: f64,
    #[serde(default)]
    generator: String,
    #[serde(default)]
    reaction: Reaction,
}

fn default_max() -> f64 {
    100.0
}

/// Construction settings of the virtual manager.
pub struct VirtualDeviceSettings {
    pub cache: Arc<dyn DeviceCache>,
    pub distributor: Arc<dyn Distributor>,
    pub upstream: Arc<dyn Upstream>,
    pub send_timeout: Duration,
}

/// Manager serving the synthetic device family.
pub struct VirtualDeviceManager {
    core: DeviceManagerCore,
    request_device_list: std::sync::atomic::AtomicBool,
}

impl VirtualDeviceManager {
    /// Creates an empty virtual manager.
    #[must_use]
    pub fn new(settings: VirtualDeviceSettings) -> Self {
        Self {
            core: DeviceManagerCore::new(
                DevicePrefix::VirtualDevice,
                settings.cache,
                settings.distributor,
                settings.upstream,
                settings.send_timeout,
            ),
            request_device_list: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Loads device definitions from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn install_from_file(&self, path: &Path) -> Result<(), ConfigError> {
        info!(path = %path.display(), "loading virtual device definitions");
        let raw = std::fs::read_to_string(path).map_err(ConfigError::DeviceFileIo)?;
        self.install_from_str(&raw)
    }

    /// Loads device definitions from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn install_from_str(&self, raw: &str) -> Result<(), ConfigError> {
        let file: VirtualDevicesFile = toml::from_str(raw)?;
        self.request_device_list.store(
            file.request_device_list,
            std::sync::atomic::Ordering::SeqCst,
        );

        let mut installed = 0usize;
        for entry in file.devices {
            if !entry.enable {
                continue;
            }
            match self.install_entry(entry) {
                Ok(()) => installed += 1,
                Err(error) => {
                    warn!(%error, "virtual device was not parsed or registered");
                }
            }
        }
        info!(installed, "loaded virtual devices");
        Ok(())
    }

    fn install_entry(&self, entry: DeviceEntry) -> Result<(), ConfigError> {
        let id = if entry.id.has_prefix(DevicePrefix::VirtualDevice) {
            entry.id
        } else {
            let forced = entry.id.with_prefix(DevicePrefix::VirtualDevice);
            warn!(original = %entry.id, forced = %forced, "device prefix was wrong, overriding id");
            forced
        };

        let mut modules = Vec::with_capacity(entry.modules.len());
        for (index, module) in entry.modules.into_iter().enumerate() {
            let generator: Generator = module.generator.parse()?;
            modules.push(VirtualModule {
                module_id: ModuleId::new(u16::try_from(index).map_err(|_| {
                    ConfigError::Validation {
                        field: "device.module",
                        reason: "too many modules".to_string(),
                    }
                })?),
                module_type: ModuleType::new(module.kind).with_attributes(module.attributes),
                min: module.min,
                max: module.max,
                generator,
                reaction: module.reaction,
                value: Mutex::new(module.min),
            });
        }

        let device = Arc::new(VirtualDevice {
            id,
            vendor: entry.vendor,
            product: entry.product,
            refresh: RefreshTime::from_secs(entry.refresh.unwrap_or(DEFAULT_REFRESH_SECS)),
            started_at: Instant::now(),
            modules,
        });

        debug!(
            device = %id,
            modules = device.modules.len(),
            paired = entry.paired,
            vendor = %device.vendor,
            product = %device.product,
            "virtual device parsed"
        );

        self.core
            .register_device(Arc::clone(&device) as Arc<dyn GatewayDevice>)
            .map_err(|error| ConfigError::Validation {
                field: "device.id",
                reason: error.to_string(),
            })?;
        if entry.paired {
            let _ = self.core.handle_accept(id);
        }
        Ok(())
    }

    /// Exposes the shared core for inspection in tests.
    #[must_use]
    pub fn core(&self) -> &DeviceManagerCore {
        &self.core
    }
}

#[async_trait]
impl DeviceManager for VirtualDeviceManager {
    fn prefix(&self) -> DevicePrefix {
        DevicePrefix::VirtualDevice
    }

    fn accept(&self, command: &ServerCommand) -> bool {
        self.core.accepts(command)
    }

    async fn handle(&self, command: ServerCommand) -> Result<(), CommandError> {
        self.core.dispatch(command).await
    }

    async fn handle_remote_status(&self, paired: &[DeviceId]) {
        self.core.handle_remote_status(paired);
    }

    async fn sync_remote_status(&self) {
        if self
            .request_device_list
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            self.core.request_remote_status().await;
        }
    }

    async fn stop(&self) {
        self.core.stop();
    }
}
