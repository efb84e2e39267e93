use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::bus::{
    AdapterInfo, BUS_EVENT_CAPACITY, BusEvent, GattLink, HciBus, HciBusProvider, Transport,
};
use crate::error::{AdapterError, FixtureError};
use crate::model::MacAddress;

/// One scripted peripheral of the fake bus.
#[derive(Debug, Clone)]
pub struct FixtureDevice {
    pub mac: MacAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<FixtureDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Settings for constructing a fake bus.
#[derive(Debug, Builder)]
pub struct FakeBusConfig {
    #[builder(into)]
    adapter_name: String,
    scan_fixture: ScanFixture,
    /// Number of `powered` polls before a requested power flip is visible.
    #[builder(default)]
    power_flip_polls: usize,
    /// When set, power transitions never take effect.
    #[builder(default)]
    power_stuck: bool,
}

/// Scripted bus used in tests and non-hardware environments.
///
/// Tests hold on to the bus and drive it by injecting events or flipping
/// classic presence while an adapter observes the same instance.
#[derive(Debug)]
pub struct FakeHciBus {
    adapter_name: String,
    devices: Mutex<Vec<FixtureDevice>>,
    powered: AtomicBool,
    power_target: AtomicBool,
    power_polls_left: AtomicUsize,
    power_flip_polls: usize,
    power_stuck: bool,
    discovering: Mutex<Option<Transport>>,
    classic_present: Mutex<HashSet<MacAddress>>,
    classic_models: Mutex<HashMap<MacAddress, String>>,
    removed: Mutex<Vec<MacAddress>>,
    gatt_reads: Mutex<HashMap<Uuid, Vec<u8>>>,
    events: broadcast::Sender<BusEvent>,
}

impl FakeHciBus {
    /// Creates a fake bus from explicit settings.
    #[must_use]
    pub fn new(config: FakeBusConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(BUS_EVENT_CAPACITY);
        Arc::new(Self {
            adapter_name: config.adapter_name,
            devices: Mutex::new(config.scan_fixture.into()),
            powered: AtomicBool::new(false),
            power_target: AtomicBool::new(false),
            power_polls_left: AtomicUsize::new(0),
            power_flip_polls: config.power_flip_polls,
            power_stuck: config.power_stuck,
            discovering: Mutex::new(None),
            classic_present: Mutex::new(HashSet::new()),
            classic_models: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            gatt_reads: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Emits an RSSI property change for a fixture device.
    pub fn inject_rssi(&self, mac: MacAddress, rssi: i16) {
        {
            let mut devices = self.devices.lock().expect("fixture lock poisoned");
            if let Some(device) = devices.iter_mut().find(|device| device.mac == mac) {
                device.rssi = Some(rssi);
            }
        }
        let _ = self.events.send(BusEvent::RssiChanged { mac, rssi });
    }

    /// Emits a manufacturer-data advertisement.
    pub fn inject_manufacturer_data(&self, mac: MacAddress, data: Vec<u8>) {
        let _ = self.events.send(BusEvent::ManufacturerData { mac, data });
    }

    /// Adds a device object mid-run, as if discovery found it.
    pub fn add_device(&self, mac: MacAddress, name: Option<String>) {
        {
            let mut devices = self.devices.lock().expect("fixture lock poisoned");
            devices.push(FixtureDevice {
                mac,
                name: name.clone(),
                rssi: None,
            });
        }
        let _ = self.events.send(BusEvent::DeviceAdded { mac, name });
    }

    /// Scripts classic inquiry visibility for one device.
    pub fn set_classic_present(&self, mac: MacAddress, present: bool, model: &str) {
        let mut classic = self.classic_present.lock().expect("classic lock poisoned");
        if present {
            classic.insert(mac);
            self.classic_models
                .lock()
                .expect("classic lock poisoned")
                .insert(mac, model.to_string());
        } else {
            classic.remove(&mac);
        }
    }

    /// Scripts the payload served for a GATT characteristic read.
    pub fn set_gatt_read(&self, characteristic: Uuid, payload: Vec<u8>) {
        self.gatt_reads
            .lock()
            .expect("gatt lock poisoned")
            .insert(characteristic, payload);
    }

    /// Devices whose removal the adapter requested.
    #[must_use]
    pub fn removed_devices(&self) -> Vec<MacAddress> {
        self.removed.lock().expect("removed lock poisoned").clone()
    }

    fn device_known(&self, mac: MacAddress) -> bool {
        self.devices
            .lock()
            .expect("fixture lock poisoned")
            .iter()
            .any(|device| device.mac == mac)
    }
}

#[async_trait]
impl HciBus for FakeHciBus {
    fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    async fn set_powered(&self, powered: bool) -> Result<(), AdapterError> {
        if self.power_stuck {
            return Ok(());
        }
        self.power_target.store(powered, Ordering::SeqCst);
        if self.power_flip_polls == 0 {
            self.powered.store(powered, Ordering::SeqCst);
        } else {
            self.power_polls_left
                .store(self.power_flip_polls, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn powered(&self) -> Result<bool, AdapterError> {
        if !self.power_stuck && self.power_polls_left.load(Ordering::SeqCst) > 0 {
            let left = self.power_polls_left.fetch_sub(1, Ordering::SeqCst);
            if left == 1 {
                self.powered
                    .store(self.power_target.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
        Ok(self.powered.load(Ordering::SeqCst))
    }

    async fn start_discovery(&self, transport: Transport) -> Result<(), AdapterError> {
        *self.discovering.lock().expect("discovery lock poisoned") = Some(transport);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), AdapterError> {
        *self.discovering.lock().expect("discovery lock poisoned") = None;
        Ok(())
    }

    async fn known_devices(&self) -> Result<Vec<(MacAddress, Option<String>)>, AdapterError> {
        let devices = self.devices.lock().expect("fixture lock poisoned");
        Ok(devices
            .iter()
            .map(|device| (device.mac, device.name.clone()))
            .collect())
    }

    async fn remove_device(&self, mac: MacAddress) -> Result<(), AdapterError> {
        {
            let mut devices = self.devices.lock().expect("fixture lock poisoned");
            devices.retain(|device| device.mac != mac);
        }
        self.removed.lock().expect("removed lock poisoned").push(mac);
        let _ = self.events.send(BusEvent::DeviceRemoved { mac });
        Ok(())
    }

    async fn open_gatt(
        &self,
        mac: MacAddress,
        _timeout: Duration,
    ) -> Result<Box<dyn GattLink>, AdapterError> {
        if !self.device_known(mac) {
            return Err(AdapterError::NotFound {
                adapter: self.adapter_name.clone(),
                mac,
            });
        }
        Ok(Box::new(FakeGattLink {
            mac,
            reads: self.gatt_reads.lock().expect("gatt lock poisoned").clone(),
            writes: Mutex::new(Vec::new()),
        }))
    }

    async fn classic_inquiry(&self) -> Result<HashMap<MacAddress, String>, AdapterError> {
        let present = self.classic_present.lock().expect("classic lock poisoned");
        let models = self.classic_models.lock().expect("classic lock poisoned");
        Ok(present
            .iter()
            .map(|mac| {
                let model = models.get(mac).cloned().unwrap_or_else(|| "unknown".to_string());
                (*mac, model)
            })
            .collect())
    }

    async fn classic_detect(&self, mac: MacAddress) -> Result<bool, AdapterError> {
        Ok(self
            .classic_present
            .lock()
            .expect("classic lock poisoned")
            .contains(&mac))
    }

    async fn info(&self) -> Result<AdapterInfo, AdapterError> {
        Ok(AdapterInfo {
            name: self.adapter_name.clone(),
            address: MacAddress::from_octets([0, 0, 0, 0, 0, 0]),
            powered: self.powered.load(Ordering::SeqCst),
            discovering: self
                .discovering
                .lock()
                .expect("discovery lock poisoned")
                .is_some(),
            known_devices: self.devices.lock().expect("fixture lock poisoned").len(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

/// Scripted GATT session recording writes and replaying reads.
#[derive(Debug)]
pub struct FakeGattLink {
    mac: MacAddress,
    reads: HashMap<Uuid, Vec<u8>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

#[async_trait]
impl GattLink for FakeGattLink {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, AdapterError> {
        self.reads
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| AdapterError::io(format!("no value for characteristic {characteristic}")))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), AdapterError> {
        self.writes
            .lock()
            .expect("write log lock poisoned")
            .push((characteristic, payload.to_vec()));
        Ok(())
    }

    async fn notified_write(
        &self,
        notify_characteristic: Uuid,
        write_characteristic: Uuid,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        self.write(write_characteristic, payload).await?;
        self.read(notify_characteristic).await
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Provider handing out preconfigured fake buses by adapter name.
#[derive(Debug, Default)]
pub struct FakeBusProvider {
    buses: Mutex<HashMap<String, Arc<FakeHciBus>>>,
}

impl FakeBusProvider {
    /// Registers a bus for later lookup by its adapter name.
    pub fn insert(&self, bus: Arc<FakeHciBus>) {
        self.buses
            .lock()
            .expect("provider lock poisoned")
            .insert(bus.adapter_name().to_string(), bus);
    }
}

#[async_trait]
impl HciBusProvider for FakeBusProvider {
    async fn open(&self, adapter_name: &str) -> Result<Arc<dyn HciBus>, AdapterError> {
        let buses = self.buses.lock().expect("provider lock poisoned");
        buses
            .get(adapter_name)
            .cloned()
            .map(|bus| bus as Arc<dyn HciBus>)
            .ok_or_else(|| AdapterError::io(format!("no fake bus named `{adapter_name}`")))
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FixtureDevice>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FixtureDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields[0].is_empty() || fields[1].is_empty() || fields[2].is_empty() {
        return Err(FixtureError::EmptyRecordField);
    }

    let mac = fields[0].parse::<MacAddress>()?;
    let name = if fields[1] == "-" {
        None
    } else {
        Some(fields[1].to_string())
    };
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };

    Ok(FixtureDevice { mac, name, rssi })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB:CC:DD:EE:01|Thermo|-42", 1)]
    #[case("AA:BB:CC:DD:EE:01|Thermo|-42;AA:BB:CC:DD:EE:02|-|-", 2)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let devices = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn scan_fixture_rejects_invalid_field_count() {
        let result = parse_scan_fixture("AA:BB:CC:DD:EE:01|Thermo");
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[test]
    fn scan_fixture_rejects_bad_mac() {
        let result = parse_scan_fixture("not-a-mac|Thermo|-42");
        assert_matches!(result, Err(FixtureError::InvalidMac(_)));
    }

    #[tokio::test]
    async fn power_flip_becomes_visible_after_configured_polls() {
        let bus = FakeHciBus::new(
            FakeBusConfig::builder()
                .adapter_name("hci0")
                .scan_fixture("AA:BB:CC:DD:EE:01|Thermo|-42".parse().expect("fixture"))
                .power_flip_polls(3)
                .build(),
        );

        bus.set_powered(true).await.expect("set power");
        assert!(!bus.powered().await.expect("poll 1"));
        assert!(!bus.powered().await.expect("poll 2"));
        assert!(bus.powered().await.expect("poll 3"));
    }

    #[tokio::test]
    async fn gatt_link_replays_scripted_reads() {
        let bus = FakeHciBus::new(
            FakeBusConfig::builder()
                .adapter_name("hci0")
                .scan_fixture("AA:BB:CC:DD:EE:01|Thermo|-42".parse().expect("fixture"))
                .build(),
        );
        let characteristic = Uuid::new_v4();
        bus.set_gatt_read(characteristic, vec![0x0f, 0x05]);

        let mac = "AA:BB:CC:DD:EE:01".parse().expect("mac");
        let link = bus
            .open_gatt(mac, Duration::from_secs(1))
            .await
            .expect("session should open");

        assert_eq!(vec![0x0f, 0x05], link.read(characteristic).await.expect("read"));
        assert_matches!(
            bus.open_gatt("AA:BB:CC:DD:EE:99".parse().expect("mac"), Duration::from_secs(1))
                .await
                .err(),
            Some(AdapterError::NotFound { .. })
        );
    }
}
