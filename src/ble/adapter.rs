use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::bus::{AdapterInfo, BusEvent, GattLink, HciBus, HciBusProvider, Transport};
use super::presence::{ClassicPresenceCache, PresencePolicy, RSSI_DEVICE_UNAVAILABLE};
use crate::config::BluetoothConfig;
use crate::error::AdapterError;
use crate::model::MacAddress;

const CHANGE_POWER_ATTEMPTS: usize = 5;
const CHANGE_POWER_DELAY: Duration = Duration::from_millis(200);

/// Callback receiving manufacturer-data advertisements of a watched device.
pub type WatchCallback = Arc<dyn Fn(MacAddress, Vec<u8>) + Send + Sync>;

#[derive(Clone)]
struct DeviceRecord {
    name: Option<String>,
    rssi: i16,
    last_seen: Instant,
    watch: Option<WatchCallback>,
}

impl DeviceRecord {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            rssi: RSSI_DEVICE_UNAVAILABLE,
            last_seen: Instant::now(),
            watch: None,
        }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

/// One BLE/classic adapter bound to a host-controller bus.
///
/// A dedicated task consumes the bus event stream and keeps the device map
/// current; user callbacks are invoked with the map lock released.
pub struct BleAdapter {
    bus: Arc<dyn HciBus>,
    policy: PresencePolicy,
    classic: ClassicPresenceCache,
    devices: StdMutex<HashMap<MacAddress, DeviceRecord>>,
    /// Serializes power and discovery transitions.
    status: Mutex<()>,
    reset_notify: Notify,
    unhealthy: AtomicBool,
    cancel: CancellationToken,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BleAdapter {
    /// Binds an adapter to a bus, seeding the device map from objects the
    /// bus already knows.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial device enumeration fails.
    pub async fn new(
        bus: Arc<dyn HciBus>,
        config: &BluetoothConfig,
    ) -> Result<Arc<Self>, AdapterError> {
        let mut devices = HashMap::new();
        for (mac, name) in bus.known_devices().await? {
            devices.insert(mac, DeviceRecord::new(name));
        }
        debug!(
            adapter = bus.adapter_name(),
            seeded = devices.len(),
            "seeded device map from known bus objects"
        );

        let adapter = Arc::new(Self {
            policy: PresencePolicy {
                max_age_rssi: config.le_max_age_rssi,
                max_unavailability: config.le_max_unavailability_time,
            },
            classic: ClassicPresenceCache::new(config.classic_artificial_availability_timeout),
            devices: StdMutex::new(devices),
            status: Mutex::new(()),
            reset_notify: Notify::new(),
            unhealthy: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            event_task: StdMutex::new(None),
            bus,
        });

        let events = adapter.bus.subscribe();
        let task = tokio::spawn(run_event_loop(Arc::clone(&adapter), events));
        *adapter
            .event_task
            .lock()
            .expect("event task lock poisoned") = Some(task);
        Ok(adapter)
    }

    /// Returns the adapter name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.bus.adapter_name()
    }

    /// Powers the adapter on and leaves it in LE discovery mode.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::PowerTimeout`] when the power state fails to
    /// flip within the polling window.
    #[instrument(skip(self), fields(adapter = self.name()))]
    pub async fn up(&self) -> Result<(), AdapterError> {
        debug!("bringing adapter up");
        let _guard = self.status.lock().await;

        if !self.bus.powered().await? {
            self.bus.set_powered(true).await?;
            if let Err(error) = self.wait_until_powered(true).await {
                self.unhealthy.store(true, Ordering::SeqCst);
                return Err(error);
            }
        }
        self.bus.start_discovery(Transport::LowEnergy).await?;
        self.unhealthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Powers the adapter off. Idempotent; wakes any in-progress LE scan.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::PowerTimeout`] when the power state fails to
    /// flip within the polling window.
    #[instrument(skip(self), fields(adapter = self.name()))]
    pub async fn down(&self) -> Result<(), AdapterError> {
        debug!("switching adapter down");
        self.reset_notify.notify_waiters();
        let _guard = self.status.lock().await;

        if !self.bus.powered().await? {
            return Ok(());
        }
        self.bus.set_powered(false).await?;
        self.wait_until_powered(false).await
    }

    /// Power-cycles the adapter.
    ///
    /// # Errors
    ///
    /// Propagates power-transition failures from either half.
    pub async fn reset(&self) -> Result<(), AdapterError> {
        self.down().await?;
        self.up().await
    }

    async fn wait_until_powered(&self, target: bool) -> Result<(), AdapterError> {
        for _ in 0..CHANGE_POWER_ATTEMPTS {
            if self.bus.powered().await? == target {
                return Ok(());
            }
            tokio::time::sleep(CHANGE_POWER_DELAY).await;
        }
        Err(AdapterError::PowerTimeout {
            adapter: self.name().to_string(),
        })
    }

    /// Scans for LE devices for `timeout` and returns the visible ones as
    /// `MAC → name`. Returns early when [`down`](Self::down) is invoked
    /// concurrently. Records stale beyond the unavailability window are
    /// dropped together with their bus objects.
    #[instrument(skip(self), fields(adapter = self.name()))]
    pub async fn le_scan(
        &self,
        timeout: Duration,
    ) -> Result<HashMap<MacAddress, String>, AdapterError> {
        info!(seconds = timeout.as_secs(), "starting LE scan");
        self.bus.start_discovery(Transport::LowEnergy).await?;

        if tokio::time::timeout(timeout, self.reset_notify.notified())
            .await
            .is_ok()
        {
            debug!("LE scan terminated prematurely");
        }

        let now = Instant::now();
        let (found, expired) = {
            let devices = self.devices.lock().expect("device map lock poisoned");
            let mut found = HashMap::new();
            let mut expired = Vec::new();
            for (mac, record) in devices.iter() {
                if self.policy.visible(record.last_seen, record.rssi, now) {
                    found.insert(*mac, record.display_name());
                } else if record.watch.is_none()
                    && self.policy.expired(record.last_seen, now)
                {
                    expired.push(*mac);
                }
            }
            (found, expired)
        };

        for mac in expired {
            self.drop_device(mac).await;
        }

        info!(found = found.len(), "LE scan finished");
        Ok(found)
    }

    async fn drop_device(&self, mac: MacAddress) {
        let removed = {
            let mut devices = self.devices.lock().expect("device map lock poisoned");
            devices.remove(&mac).is_some()
        };
        if !removed {
            return;
        }
        info!(%mac, "removing unavailable LE device after long inactivity");
        if let Err(error) = self.bus.remove_device(mac).await {
            warn!(%mac, %error, "failed to remove device object from the bus");
        }
    }

    /// Synchronous classic inquiry; returns `MAC → model string`.
    ///
    /// # Errors
    ///
    /// Propagates inquiry failures from the bus.
    pub async fn scan(&self) -> Result<HashMap<MacAddress, String>, AdapterError> {
        self.bus.classic_inquiry().await
    }

    /// Classic presence test with artificial-availability smoothing.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; a clean "not found" is `Ok(false)`.
    pub async fn detect(&self, mac: MacAddress) -> Result<bool, AdapterError> {
        let detected = self.bus.classic_detect(mac).await?;
        Ok(self.classic.smooth(mac, detected))
    }

    /// Opens a GATT session to a device known to this adapter.
    ///
    /// # Errors
    ///
    /// [`AdapterError::NotFound`] for an unknown MAC, [`AdapterError::Io`]
    /// on link failures.
    pub async fn connect(
        &self,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<Box<dyn GattLink>, AdapterError> {
        debug!(%mac, "connecting to device");
        let known = {
            let devices = self.devices.lock().expect("device map lock poisoned");
            devices.contains_key(&mac)
        };
        if !known {
            return Err(AdapterError::NotFound {
                adapter: self.name().to_string(),
                mac,
            });
        }
        self.bus.open_gatt(mac, timeout).await
    }

    /// Subscribes to manufacturer-data advertisements of one device.
    /// Watching an already-watched device is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::NotFound`] for an unknown MAC.
    pub fn watch(&self, mac: MacAddress, callback: WatchCallback) -> Result<(), AdapterError> {
        let mut devices = self.devices.lock().expect("device map lock poisoned");
        let Some(record) = devices.get_mut(&mac) else {
            return Err(AdapterError::NotFound {
                adapter: self.name().to_string(),
                mac,
            });
        };
        if record.watch.is_some() {
            return Ok(());
        }
        debug!(%mac, "watching device");
        record.watch = Some(callback);
        Ok(())
    }

    /// Drops the manufacturer-data subscription of one device, if any.
    pub fn unwatch(&self, mac: MacAddress) {
        let mut devices = self.devices.lock().expect("device map lock poisoned");
        if let Some(record) = devices.get_mut(&mac)
            && record.watch.take().is_some()
        {
            debug!(%mac, "unwatched device");
        }
    }

    /// Adapter metadata as reported by the kernel.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub async fn info(&self) -> Result<AdapterInfo, AdapterError> {
        let mut info = self.bus.info().await?;
        info.known_devices = self.devices.lock().expect("device map lock poisoned").len();
        Ok(info)
    }

    /// Whether the last power cycle succeeded. An unhealthy adapter is
    /// retried at the next [`up`](Self::up) call.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    /// Stops the event loop and discovery.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.reset_notify.notify_waiters();
        if let Err(error) = self.bus.stop_discovery().await {
            debug!(%error, "failed to stop discovery cleanly");
        }
        let task = self
            .event_task
            .lock()
            .expect("event task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::DeviceAdded { mac, name } => {
                let mut devices = self.devices.lock().expect("device map lock poisoned");
                devices.entry(mac).or_insert_with(|| DeviceRecord::new(name));
            }
            BusEvent::DeviceRemoved { mac } => {
                let mut devices = self.devices.lock().expect("device map lock poisoned");
                devices.remove(&mac);
            }
            BusEvent::RssiChanged { mac, rssi } => {
                let mut devices = self.devices.lock().expect("device map lock poisoned");
                if let Some(record) = devices.get_mut(&mac) {
                    record.rssi = rssi;
                    record.last_seen = Instant::now();
                } else {
                    debug!(%mac, "RSSI change for unknown device");
                }
            }
            BusEvent::ManufacturerData { mac, data } => {
                // Copy the callback out so it runs without the map lock.
                let callback = {
                    let devices = self.devices.lock().expect("device map lock poisoned");
                    devices.get(&mac).and_then(|record| record.watch.clone())
                };
                if let Some(callback) = callback {
                    callback(mac, data);
                }
            }
        }
    }
}

async fn run_event_loop(adapter: Arc<BleAdapter>, mut events: broadcast::Receiver<BusEvent>) {
    loop {
        tokio::select! {
            () = adapter.cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => adapter.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "bus event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(adapter = adapter.name(), "adapter event loop exiting");
}

/// Keeps one adapter instance per name, creating on first lookup.
pub struct AdapterManager {
    provider: Arc<dyn HciBusProvider>,
    config: BluetoothConfig,
    adapters: Mutex<HashMap<String, Arc<BleAdapter>>>,
}

impl AdapterManager {
    /// Creates a manager over a bus provider.
    #[must_use]
    pub fn new(provider: Arc<dyn HciBusProvider>, config: BluetoothConfig) -> Self {
        Self {
            provider,
            config,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the adapter for `name`, reusing an existing instance.
    ///
    /// # Errors
    ///
    /// Propagates bus-opening failures.
    pub async fn lookup(&self, name: &str) -> Result<Arc<BleAdapter>, AdapterError> {
        let mut adapters = self.adapters.lock().await;
        if let Some(adapter) = adapters.get(name) {
            return Ok(Arc::clone(adapter));
        }

        let bus = self.provider.open(name).await?;
        let adapter = BleAdapter::new(bus, &self.config).await?;
        adapters.insert(name.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Stops every adapter created by this manager.
    pub async fn stop_all(&self) {
        let adapters: Vec<Arc<BleAdapter>> = {
            let adapters = self.adapters.lock().await;
            adapters.values().cloned().collect()
        };
        for adapter in adapters {
            adapter.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ble::fake_bus::{FakeBusConfig, FakeHciBus};

    fn mac(last: u8) -> MacAddress {
        MacAddress::from_octets([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn bluetooth_config() -> BluetoothConfig {
        BluetoothConfig {
            adapter: "hci0".to_string(),
            le_max_age_rssi: Duration::from_secs(30),
            le_max_unavailability_time: Duration::from_secs(600),
            classic_artificial_availability_timeout: Duration::from_secs(30),
        }
    }

    fn fixture_bus(power_flip_polls: usize, power_stuck: bool) -> Arc<FakeHciBus> {
        FakeHciBus::new(
            FakeBusConfig::builder()
                .adapter_name("hci0")
                .scan_fixture(
                    "AA:BB:CC:DD:EE:01|Thermo|-42;AA:BB:CC:DD:EE:02|Plug|-60"
                        .parse()
                        .expect("fixture should parse"),
                )
                .power_flip_polls(power_flip_polls)
                .power_stuck(power_stuck)
                .build(),
        )
    }

    async fn adapter_over(bus: &Arc<FakeHciBus>) -> Arc<BleAdapter> {
        BleAdapter::new(
            Arc::clone(bus) as Arc<dyn HciBus>,
            &bluetooth_config(),
        )
        .await
        .expect("adapter should build")
    }

    #[tokio::test]
    async fn up_is_idempotent_and_tolerates_slow_power_flips() {
        let bus = fixture_bus(3, false);
        let adapter = adapter_over(&bus).await;

        adapter.up().await.expect("adapter should come up");
        adapter.up().await.expect("second up should be a no-op");
        assert!(adapter.is_healthy());

        adapter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_power_surfaces_timeout_and_marks_unhealthy() {
        let bus = fixture_bus(0, true);
        let adapter = adapter_over(&bus).await;

        let result = adapter.up().await;

        assert_matches!(result, Err(AdapterError::PowerTimeout { .. }));
        assert!(!adapter.is_healthy());

        adapter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn le_scan_applies_the_visibility_window() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;
        adapter.up().await.expect("adapter should come up");

        bus.inject_rssi(mac(0x01), -42);
        tokio::task::yield_now().await;

        let found = adapter
            .le_scan(Duration::from_millis(10))
            .await
            .expect("scan should succeed");
        assert_eq!(1, found.len());
        assert_eq!(Some("Thermo"), found.get(&mac(0x01)).map(String::as_str));

        tokio::time::advance(Duration::from_secs(31)).await;
        let found = adapter
            .le_scan(Duration::from_millis(10))
            .await
            .expect("scan should succeed");
        assert!(found.is_empty());

        adapter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn le_scan_evicts_long_unavailable_devices() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;
        adapter.up().await.expect("adapter should come up");

        bus.inject_rssi(mac(0x01), -42);
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(601)).await;
        let found = adapter
            .le_scan(Duration::from_millis(10))
            .await
            .expect("scan should succeed");

        assert!(found.is_empty());
        let removed = bus.removed_devices();
        assert!(removed.contains(&mac(0x01)));
        assert!(removed.contains(&mac(0x02)));

        adapter.stop().await;
    }

    #[tokio::test]
    async fn down_terminates_a_running_scan_early() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;
        adapter.up().await.expect("adapter should come up");

        let scanner = Arc::clone(&adapter);
        let scan = tokio::spawn(async move { scanner.le_scan(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;

        adapter.down().await.expect("adapter should go down");

        let found = tokio::time::timeout(Duration::from_secs(1), scan)
            .await
            .expect("scan should end early")
            .expect("scan task should not panic")
            .expect("scan should succeed");
        assert!(found.is_empty());

        adapter.stop().await;
    }

    #[tokio::test]
    async fn watch_is_a_no_op_on_watched_devices_and_delivers_data() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;

        let received: Arc<Mutex<Vec<(MacAddress, Vec<u8>)>>> = Arc::default();
        let sink = Arc::clone(&received);
        let callback: WatchCallback = Arc::new(move |mac, data| {
            sink.lock().expect("sink lock").push((mac, data));
        });

        adapter
            .watch(mac(0x01), Arc::clone(&callback))
            .expect("watch should register");
        adapter
            .watch(mac(0x01), callback)
            .expect("second watch should be a no-op");
        assert_matches!(
            adapter.watch(mac(0x99), Arc::new(|_, _| {})),
            Err(AdapterError::NotFound { .. })
        );

        bus.inject_manufacturer_data(mac(0x01), vec![0x4c, 0x00]);
        tokio::task::yield_now().await;

        {
            let received = received.lock().expect("sink lock");
            assert_eq!(1, received.len());
            assert_eq!((mac(0x01), vec![0x4c, 0x00]), received[0]);
        }

        adapter.unwatch(mac(0x01));
        bus.inject_manufacturer_data(mac(0x01), vec![0xff]);
        tokio::task::yield_now().await;
        assert_eq!(1, received.lock().expect("sink lock").len());

        adapter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn detect_smooths_classic_flapping() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;
        let target = mac(0x05);

        bus.set_classic_present(target, true, "Headset");
        assert!(adapter.detect(target).await.expect("detect"));

        bus.set_classic_present(target, false, "Headset");
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(adapter.detect(target).await.expect("detect"));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!adapter.detect(target).await.expect("detect"));

        adapter.stop().await;
    }

    #[tokio::test]
    async fn connect_rejects_unknown_devices() {
        let bus = fixture_bus(0, false);
        let adapter = adapter_over(&bus).await;

        let session = adapter
            .connect(mac(0x01), Duration::from_secs(1))
            .await
            .expect("session should open");
        assert_eq!(mac(0x01), session.mac());

        assert_matches!(
            adapter.connect(mac(0x77), Duration::from_secs(1)).await.err(),
            Some(AdapterError::NotFound { .. })
        );

        adapter.stop().await;
    }

    #[tokio::test]
    async fn manager_returns_the_same_instance_per_name() {
        let provider = Arc::new(crate::ble::fake_bus::FakeBusProvider::default());
        provider.insert(fixture_bus(0, false));
        let manager = AdapterManager::new(provider, bluetooth_config());

        let first = manager.lookup("hci0").await.expect("lookup should work");
        let second = manager.lookup("hci0").await.expect("lookup should work");

        assert!(Arc::ptr_eq(&first, &second));
        assert_matches!(manager.lookup("hci9").await.err(), Some(AdapterError::Io { .. }));

        manager.stop_all().await;
    }
}
