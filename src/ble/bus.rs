use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AdapterError;
use crate::model::MacAddress;

pub(crate) const BUS_EVENT_CAPACITY: usize = 1024;

/// Typed event translated from the object-manager bus.
///
/// Raw signal callbacks stay inside the backend; the adapter consumes this
/// stream from a single owner task.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A device object appeared under the adapter.
    DeviceAdded {
        mac: MacAddress,
        name: Option<String>,
    },
    /// The device object was removed from the bus.
    DeviceRemoved { mac: MacAddress },
    /// The device advertised and its RSSI property changed.
    RssiChanged { mac: MacAddress, rssi: i16 },
    /// The device broadcast a manufacturer-data advertisement.
    ManufacturerData { mac: MacAddress, data: Vec<u8> },
}

/// Radio selected for discovery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transport {
    LowEnergy,
    Classic,
}

/// Adapter metadata as reported by the kernel side.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub address: MacAddress,
    pub powered: bool,
    pub discovering: bool,
    pub known_devices: usize,
}

/// An open GATT session to one device.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Address of the connected device.
    fn mac(&self) -> MacAddress;

    /// Reads one characteristic value.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, AdapterError>;

    /// Writes a payload to one characteristic.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), AdapterError>;

    /// Subscribes to `notify_characteristic`, writes the payload and
    /// returns the first notification within `timeout`.
    async fn notified_write(
        &self,
        notify_characteristic: Uuid,
        write_characteristic: Uuid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError>;

    /// Closes the session.
    async fn disconnect(&self) -> Result<(), AdapterError>;
}

/// Host-controller bus surface the adapter is built on.
///
/// The real implementation talks to BlueZ over the system D-Bus; the fake
/// one replays scripted fixtures for tests and hardware-free runs.
#[async_trait]
pub trait HciBus: Send + Sync {
    /// Name of the backing adapter, e.g. `hci0`.
    fn adapter_name(&self) -> &str;

    async fn set_powered(&self, powered: bool) -> Result<(), AdapterError>;

    async fn powered(&self) -> Result<bool, AdapterError>;

    /// Starts discovery on the given transport; already-running discovery
    /// is not an error.
    async fn start_discovery(&self, transport: Transport) -> Result<(), AdapterError>;

    async fn stop_discovery(&self) -> Result<(), AdapterError>;

    /// Devices the bus already knows about, for seeding the device map.
    async fn known_devices(&self) -> Result<Vec<(MacAddress, Option<String>)>, AdapterError>;

    /// Requests removal of the device object from the bus.
    async fn remove_device(&self, mac: MacAddress) -> Result<(), AdapterError>;

    /// Opens a GATT session to a device known to the bus.
    async fn open_gatt(
        &self,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<Box<dyn GattLink>, AdapterError>;

    /// Synchronous classic inquiry returning `MAC → model string`.
    async fn classic_inquiry(&self) -> Result<HashMap<MacAddress, String>, AdapterError>;

    /// Raw classic presence test, without availability smoothing.
    async fn classic_detect(&self, mac: MacAddress) -> Result<bool, AdapterError>;

    async fn info(&self) -> Result<AdapterInfo, AdapterError>;

    /// Subscribes to the translated bus event stream.
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// Factory yielding one bus per adapter name.
#[async_trait]
pub trait HciBusProvider: Send + Sync {
    async fn open(&self, adapter_name: &str) -> Result<std::sync::Arc<dyn HciBus>, AdapterError>;
}
