mod cache;
mod manager;
mod poller;
mod virtual_manager;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::model::{
    DeviceDescription, DeviceId, ModuleId, ModuleType, Reaction, RefreshTime, SensorData,
};

pub use self::cache::{DeviceCache, InMemoryDeviceCache};
pub use self::manager::{DeviceManager, DeviceManagerCore, ServerCommand};
pub use self::poller::{Distributor, PollingKeeper};
pub use self::virtual_manager::{VirtualDeviceManager, VirtualDeviceSettings};

/// Capability surface of one managed device.
///
/// Drivers own their protocol details; the manager only needs identity,
/// module metadata, polling and value modification.
#[async_trait]
pub trait GatewayDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    fn vendor(&self) -> &str;

    fn product(&self) -> &str;

    /// Module types ordered by module position.
    fn module_types(&self) -> Vec<ModuleType>;

    fn refresh(&self) -> RefreshTime;

    /// Reaction of one module to set-value commands, when the module
    /// exists.
    fn reaction_of(&self, module: ModuleId) -> Option<Reaction>;

    /// Samples every module once.
    async fn poll(&self) -> Result<SensorData, CommandError>;

    /// Applies a downstream set-value; must succeed atomically or fail
    /// with `IllegalState`.
    async fn modify_value(&self, module: ModuleId, value: f64) -> Result<(), CommandError>;

    /// Description announced upstream when offering the device.
    fn description(&self) -> DeviceDescription {
        DeviceDescription::builder()
            .id(self.id())
            .vendor(self.vendor())
            .product(self.product())
            .modules(self.module_types())
            .refresh_time(self.refresh())
            .build()
    }
}
