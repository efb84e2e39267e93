//! BlueZ-backed bus implementation over the system D-Bus.
//!
//! Consumes the ObjectManager, `Adapter1` and `Device1` interfaces through
//! `bluer` and translates property-change signals into [`BusEvent`]s owned
//! by the adapter's event loop. BlueZ's "operation already in progress"
//! error is treated as success, matching how discovery and connect behave
//! when another client raced us.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, DeviceEvent, DeviceProperty, DiscoveryFilter, Session};
use futures_util::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{
    AdapterInfo, BUS_EVENT_CAPACITY, BusEvent, GattLink, HciBus, HciBusProvider, Transport,
};
use crate::error::AdapterError;
use crate::model::MacAddress;

const CLASSIC_INQUIRY_WINDOW: Duration = Duration::from_secs(10);
const CLASSIC_DETECT_WINDOW: Duration = Duration::from_secs(5);

fn mac_of(address: bluer::Address) -> MacAddress {
    MacAddress::from_octets(address.0)
}

fn address_of(mac: MacAddress) -> bluer::Address {
    bluer::Address(mac.octets())
}

fn map_bus_error(error: bluer::Error) -> AdapterError {
    AdapterError::io(error.to_string())
}

/// Absorbs BlueZ's in-progress error; whether that can mask a legitimate
/// failure is unclear, so the occurrence is logged.
fn absorb_in_progress(result: bluer::Result<()>) -> Result<(), AdapterError> {
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind == bluer::ErrorKind::InProgress => {
            debug!("bus operation already in progress, treating as success");
            Ok(())
        }
        Err(error) => Err(map_bus_error(error)),
    }
}

fn transport_filter(transport: Transport) -> DiscoveryFilter {
    let transport = match transport {
        Transport::LowEnergy => bluer::DiscoveryTransport::Le,
        Transport::Classic => bluer::DiscoveryTransport::BrEdr,
    };
    DiscoveryFilter {
        transport,
        ..DiscoveryFilter::default()
    }
}

struct DiscoveryTask {
    transport: Transport,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The BlueZ adapter surface behind the [`HciBus`] seam.
pub struct BluerBus {
    adapter: Adapter,
    name: String,
    events: broadcast::Sender<BusEvent>,
    discovery: Mutex<Option<DiscoveryTask>>,
}

impl BluerBus {
    fn new(adapter: Adapter) -> Self {
        let (events, _) = broadcast::channel(BUS_EVENT_CAPACITY);
        let name = adapter.name().to_string();
        Self {
            adapter,
            name,
            events,
            discovery: Mutex::new(None),
        }
    }

    /// Runs a bounded inquiry on one transport, collecting discovered
    /// devices as `MAC → name`.
    async fn bounded_inquiry(
        &self,
        transport: Transport,
        window: Duration,
    ) -> Result<HashMap<MacAddress, String>, AdapterError> {
        self.adapter
            .set_discovery_filter(transport_filter(transport))
            .await
            .map_err(map_bus_error)?;
        let discovered = self
            .adapter
            .discover_devices()
            .await
            .map_err(map_bus_error)?;
        futures_util::pin_mut!(discovered);

        let mut found = HashMap::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let event = tokio::time::timeout_at(deadline, discovered.next()).await;
            match event {
                Ok(Some(AdapterEvent::DeviceAdded(address))) => {
                    let mac = mac_of(address);
                    let name = self
                        .device_name(address)
                        .await
                        .unwrap_or_else(|| "unknown".to_string());
                    found.insert(mac, name);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        Ok(found)
    }

    async fn device_name(&self, address: bluer::Address) -> Option<String> {
        let device = self.adapter.device(address).ok()?;
        device.name().await.ok().flatten()
    }
}

#[async_trait]
impl HciBus for BluerBus {
    fn adapter_name(&self) -> &str {
        &self.name
    }

    async fn set_powered(&self, powered: bool) -> Result<(), AdapterError> {
        self.adapter
            .set_powered(powered)
            .await
            .map_err(map_bus_error)
    }

    async fn powered(&self) -> Result<bool, AdapterError> {
        self.adapter.is_powered().await.map_err(map_bus_error)
    }

    async fn start_discovery(&self, transport: Transport) -> Result<(), AdapterError> {
        let mut discovery = self.discovery.lock().await;
        if let Some(running) = discovery.as_ref() {
            if running.transport == transport {
                return Ok(());
            }
            running.cancel.cancel();
            running.task.abort();
            *discovery = None;
        }

        self.adapter
            .set_discovery_filter(transport_filter(transport))
            .await
            .map_err(map_bus_error)?;
        let stream = match self.adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(error) if error.kind == bluer::ErrorKind::InProgress => {
                debug!("discovery already in progress, treating as success");
                return Ok(());
            }
            Err(error) => return Err(map_bus_error(error)),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_discovery(
            self.adapter.clone(),
            self.events.clone(),
            cancel.clone(),
            stream,
        ));
        *discovery = Some(DiscoveryTask {
            transport,
            cancel,
            task,
        });
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), AdapterError> {
        let mut discovery = self.discovery.lock().await;
        if let Some(running) = discovery.take() {
            running.cancel.cancel();
            running.task.abort();
        }
        Ok(())
    }

    async fn known_devices(&self) -> Result<Vec<(MacAddress, Option<String>)>, AdapterError> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(map_bus_error)?;
        let mut devices = Vec::with_capacity(addresses.len());
        for address in addresses {
            devices.push((mac_of(address), self.device_name(address).await));
        }
        Ok(devices)
    }

    async fn remove_device(&self, mac: MacAddress) -> Result<(), AdapterError> {
        absorb_in_progress(self.adapter.remove_device(address_of(mac)).await)
    }

    async fn open_gatt(
        &self,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<Box<dyn GattLink>, AdapterError> {
        let device = self
            .adapter
            .device(address_of(mac))
            .map_err(|_| AdapterError::NotFound {
                adapter: self.name.clone(),
                mac,
            })?;

        if !device.is_connected().await.map_err(map_bus_error)? {
            let connected = tokio::time::timeout(timeout, device.connect()).await;
            match connected {
                Ok(result) => absorb_in_progress(result)?,
                Err(_) => {
                    return Err(AdapterError::Timeout {
                        operation: "connect",
                        mac,
                    });
                }
            }
        }

        Ok(Box::new(BluerGattLink { device, mac }))
    }

    async fn classic_inquiry(&self) -> Result<HashMap<MacAddress, String>, AdapterError> {
        self.bounded_inquiry(Transport::Classic, CLASSIC_INQUIRY_WINDOW)
            .await
    }

    async fn classic_detect(&self, mac: MacAddress) -> Result<bool, AdapterError> {
        let found = self
            .bounded_inquiry(Transport::Classic, CLASSIC_DETECT_WINDOW)
            .await?;
        Ok(found.contains_key(&mac))
    }

    async fn info(&self) -> Result<AdapterInfo, AdapterError> {
        let address = self.adapter.address().await.map_err(map_bus_error)?;
        Ok(AdapterInfo {
            name: self.name.clone(),
            address: mac_of(address),
            powered: self.adapter.is_powered().await.map_err(map_bus_error)?,
            discovering: self
                .adapter
                .is_discovering()
                .await
                .map_err(map_bus_error)?,
            known_devices: self
                .adapter
                .device_addresses()
                .await
                .map_err(map_bus_error)?
                .len(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

/// Consumes adapter discovery events and keeps one property monitor per
/// device object alive.
async fn run_discovery(
    adapter: Adapter,
    events: broadcast::Sender<BusEvent>,
    cancel: CancellationToken,
    discovered: impl futures_util::Stream<Item = AdapterEvent> + Send + 'static,
) {
    futures_util::pin_mut!(discovered);
    let mut monitors: HashMap<MacAddress, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = discovered.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    let mac = mac_of(address);
                    let name = match adapter.device(address) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(_) => None,
                    };
                    let _ = events.send(BusEvent::DeviceAdded { mac, name });

                    if let Ok(device) = adapter.device(address) {
                        let monitor = tokio::spawn(run_device_monitor(
                            device,
                            mac,
                            events.clone(),
                            cancel.clone(),
                        ));
                        if let Some(stale) = monitors.insert(mac, monitor) {
                            stale.abort();
                        }
                    }
                }
                Some(AdapterEvent::DeviceRemoved(address)) => {
                    let mac = mac_of(address);
                    if let Some(monitor) = monitors.remove(&mac) {
                        monitor.abort();
                    }
                    let _ = events.send(BusEvent::DeviceRemoved { mac });
                }
                Some(AdapterEvent::PropertyChanged(_)) => {}
                None => break,
            }
        }
    }

    for monitor in monitors.into_values() {
        monitor.abort();
    }
    debug!("discovery pump exiting");
}

/// Translates one device's property changes into bus events.
async fn run_device_monitor(
    device: bluer::Device,
    mac: MacAddress,
    events: broadcast::Sender<BusEvent>,
    cancel: CancellationToken,
) {
    let properties = match device.events().await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%mac, %error, "failed to monitor device properties");
            return;
        }
    };
    futures_util::pin_mut!(properties);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = properties.next() => match event {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi))) => {
                    let _ = events.send(BusEvent::RssiChanged { mac, rssi });
                }
                Some(DeviceEvent::PropertyChanged(DeviceProperty::ManufacturerData(data))) => {
                    for payload in data.into_values() {
                        let _ = events.send(BusEvent::ManufacturerData {
                            mac,
                            data: payload,
                        });
                    }
                }
                Some(DeviceEvent::PropertyChanged(_)) => {}
                None => break,
            }
        }
    }
}

/// GATT session over a connected BlueZ device.
pub struct BluerGattLink {
    device: bluer::Device,
    mac: MacAddress,
}

impl BluerGattLink {
    async fn find_characteristic(
        &self,
        target: Uuid,
    ) -> Result<bluer::gatt::remote::Characteristic, AdapterError> {
        for service in self.device.services().await.map_err(map_bus_error)? {
            for characteristic in service.characteristics().await.map_err(map_bus_error)? {
                if characteristic.uuid().await.map_err(map_bus_error)? == target {
                    return Ok(characteristic);
                }
            }
        }
        Err(AdapterError::io(format!(
            "characteristic {target} not found on {mac}",
            mac = self.mac
        )))
    }
}

#[async_trait]
impl GattLink for BluerGattLink {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, AdapterError> {
        let characteristic = self.find_characteristic(characteristic).await?;
        characteristic.read().await.map_err(map_bus_error)
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), AdapterError> {
        let characteristic = self.find_characteristic(characteristic).await?;
        characteristic.write(payload).await.map_err(map_bus_error)
    }

    async fn notified_write(
        &self,
        notify_characteristic: Uuid,
        write_characteristic: Uuid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        let notify = self.find_characteristic(notify_characteristic).await?;
        let notifications = notify.notify().await.map_err(map_bus_error)?;
        futures_util::pin_mut!(notifications);

        self.write(write_characteristic, payload).await?;

        match tokio::time::timeout(timeout, notifications.next()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(AdapterError::io("notification stream closed")),
            Err(_) => Err(AdapterError::Timeout {
                operation: "notified write",
                mac: self.mac,
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.device.disconnect().await.map_err(map_bus_error)
    }
}

/// Opens BlueZ buses through one shared D-Bus session.
pub struct BluerBusProvider {
    session: Session,
}

impl BluerBusProvider {
    /// Connects to the system bus.
    ///
    /// # Errors
    ///
    /// Returns an error when the D-Bus session cannot be established.
    pub async fn new() -> Result<Self, AdapterError> {
        let session = Session::new().await.map_err(map_bus_error)?;
        Ok(Self { session })
    }
}

#[async_trait]
impl HciBusProvider for BluerBusProvider {
    async fn open(&self, adapter_name: &str) -> Result<Arc<dyn HciBus>, AdapterError> {
        let adapter = self
            .session
            .adapter(adapter_name)
            .map_err(map_bus_error)?;
        Ok(Arc::new(BluerBus::new(adapter)))
    }
}
