mod app;
mod ble;
mod config;
mod devices;
mod error;
mod gateway;
mod message;
mod model;
mod telemetry;
mod uplink;

pub use app::{Args, run};
pub use ble::{
    AdapterInfo, AdapterManager, BleAdapter, BluerBusProvider, BusEvent, FakeBusConfig,
    FakeBusProvider, FakeHciBus, FixtureDevice, GattLink, HciBus, HciBusProvider, ScanFixture,
    Transport, WatchCallback,
};
pub use config::{
    BluetoothConfig, GatewayConfig, IdentityConfig, LogFormat, TelemetryConfig, TlsConfig,
    UplinkConfig,
};
pub use devices::{
    DeviceCache, DeviceManager, DeviceManagerCore, Distributor, GatewayDevice,
    InMemoryDeviceCache, PollingKeeper, ServerCommand, VirtualDeviceManager,
    VirtualDeviceSettings,
};
pub use error::{
    AdapterError, CancelReason, CommandError, ConfigError, FixtureError, TelemetryError,
    UplinkError,
};
pub use gateway::{Gateway, UplinkDistributor};
pub use message::{CommandStatus, FrameError, GwMessage};
pub use model::{
    DeviceDescription, DeviceId, DevicePrefix, IdParseError, MacAddress, ModuleAttribute,
    ModuleId, ModuleKind, ModuleType, ModuleValue, Reaction, RefreshTime, SensorData,
};
pub use uplink::{LinkState, UplinkConnector, Upstream};
