use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use fieldgate::{
    CommandError, DeviceCache, DeviceId, DevicePrefix, Distributor, DeviceManager, GwMessage,
    InMemoryDeviceCache, ModuleId, SensorData, ServerCommand, UplinkError, Upstream,
    VirtualDeviceManager, VirtualDeviceSettings,
};

const DEFINITIONS: &str = r#"
request_device_list = true

[[device]]
id = "0xa300000000000001"
vendor = "Acme"
product = "Climate Probe"
refresh = 5

[[device.module]]
type = "temperature"
attributes = ["inner"]
min = 15.0
max = 30.0
generator = "random"
reaction = "none"

[[device.module]]
type = "on_off"
attributes = ["controllable"]
min = 0.0
max = 1.0
generator = "none"
reaction = "success"

[[device.module]]
type = "brightness"
min = 0.0
max = 100.0
generator = "none"
reaction = "failure"

[[device]]
id = "0x0000000000000002"
vendor = "Acme"
product = "Power Plug"
refresh = 5
paired = true

[[device.module]]
type = "on_off"
attributes = ["controllable"]
generator = "none"
reaction = "success"

[[device]]
enable = false
id = "0xa300000000000003"
vendor = "Acme"
product = "Disabled"
"#;

fn probe_id() -> DeviceId {
    DeviceId::new(DevicePrefix::VirtualDevice, 1)
}

/// The plug was declared with a wrong prefix; installation forces the
/// virtual one.
fn plug_id() -> DeviceId {
    DeviceId::new(DevicePrefix::VirtualDevice, 2)
}

#[derive(Default)]
struct RecordingDistributor {
    shipped: Mutex<Vec<SensorData>>,
}

impl Distributor for RecordingDistributor {
    fn ship(&self, data: SensorData) {
        self.shipped.lock().expect("shipped lock").push(data);
    }
}

/// Upstream stub answering device-list requests from a scripted snapshot.
#[derive(Default)]
struct StubUpstream {
    sent: Mutex<Vec<GwMessage>>,
    paired_snapshot: Mutex<Vec<DeviceId>>,
}

#[async_trait]
impl Upstream for StubUpstream {
    fn send(&self, message: GwMessage) {
        self.sent.lock().expect("sent lock").push(message);
    }

    async fn request(
        &self,
        message: GwMessage,
        _timeout: Duration,
    ) -> Result<GwMessage, UplinkError> {
        let reply = match &message {
            GwMessage::NewDeviceRequest { id, .. } => GwMessage::NewDeviceResponse {
                id: *id,
                accepted: true,
            },
            GwMessage::DeviceListRequest { id, .. } => GwMessage::DeviceListResponse {
                id: *id,
                devices: self.paired_snapshot.lock().expect("snapshot lock").clone(),
            },
            GwMessage::LastValueRequest { id, .. } => GwMessage::LastValueResponse {
                id: *id,
                value: 42.0,
            },
            _ => return Err(UplinkError::Timeout),
        };
        self.sent.lock().expect("sent lock").push(message);
        Ok(reply)
    }
}

struct Fixture {
    manager: VirtualDeviceManager,
    cache: Arc<InMemoryDeviceCache>,
    upstream: Arc<StubUpstream>,
}

fn fixture() -> Fixture {
    let cache = Arc::new(InMemoryDeviceCache::default());
    let upstream = Arc::new(StubUpstream::default());
    let manager = VirtualDeviceManager::new(VirtualDeviceSettings {
        cache: Arc::clone(&cache) as Arc<dyn DeviceCache>,
        distributor: Arc::new(RecordingDistributor::default()),
        upstream: Arc::clone(&upstream) as Arc<dyn Upstream>,
        send_timeout: Duration::from_millis(100),
    });
    manager
        .install_from_str(DEFINITIONS)
        .expect("definitions should load");
    Fixture {
        manager,
        cache,
        upstream,
    }
}

fn accept(device_id: DeviceId) -> ServerCommand {
    ServerCommand::Accept {
        id: Uuid::new_v4(),
        device_id,
    }
}

fn unpair(device_id: DeviceId) -> ServerCommand {
    ServerCommand::Unpair {
        id: Uuid::new_v4(),
        device_id,
    }
}

fn set_value(device_id: DeviceId, module: u16, value: f64) -> ServerCommand {
    ServerCommand::SetValue {
        id: Uuid::new_v4(),
        device_id,
        module_id: ModuleId::new(module),
        value,
    }
}

#[tokio::test]
async fn installation_forces_the_virtual_prefix_and_schedules_paired_devices() {
    let Fixture { manager, cache, .. } = fixture();

    assert!(manager.core().device(probe_id()).is_some());
    assert!(manager.core().device(plug_id()).is_some());
    assert!(
        manager
            .core()
            .device(DeviceId::new(DevicePrefix::VirtualDevice, 3))
            .is_none(),
        "disabled devices must not be installed"
    );

    assert!(cache.paired(plug_id()));
    assert!(manager.core().is_scheduled(plug_id()));
    assert!(!cache.paired(probe_id()));
    assert!(!manager.core().is_scheduled(probe_id()));
}

#[tokio::test]
async fn accept_then_unpair_toggles_the_poll_schedule() {
    let Fixture { manager, cache, .. } = fixture();
    let baseline = manager.core().scheduled_count();

    manager
        .handle(accept(probe_id()))
        .await
        .expect("accept should succeed");
    assert_eq!(baseline + 1, manager.core().scheduled_count());
    assert!(cache.paired(probe_id()));

    // Accepting an already-paired device warns but stays idempotent.
    manager
        .handle(accept(probe_id()))
        .await
        .expect("repeated accept should succeed");
    assert_eq!(baseline + 1, manager.core().scheduled_count());

    manager
        .handle(unpair(probe_id()))
        .await
        .expect("unpair should succeed");
    assert_eq!(baseline, manager.core().scheduled_count());
    assert!(!cache.paired(probe_id()));

    // Unpairing an unknown device warns without erroring.
    manager
        .handle(unpair(DeviceId::new(DevicePrefix::VirtualDevice, 99)))
        .await
        .expect("unknown unpair should not error");
}

#[tokio::test]
async fn accept_of_unknown_device_is_not_found() {
    let Fixture { manager, .. } = fixture();

    let result = manager
        .handle(accept(DeviceId::new(DevicePrefix::VirtualDevice, 99)))
        .await;

    assert_matches!(result, Err(CommandError::NotFound { .. }));
}

#[tokio::test]
async fn set_value_respects_module_reactions() {
    let Fixture { manager, .. } = fixture();

    assert_matches!(
        manager.handle(set_value(probe_id(), 0, 21.5)).await,
        Err(CommandError::InvalidAccess { .. }),
        "a reaction-none module must reject set-value"
    );

    manager
        .handle(set_value(probe_id(), 1, 1.0))
        .await
        .expect("reactive module should accept the value");

    assert_matches!(
        manager.handle(set_value(probe_id(), 2, 50.0)).await,
        Err(CommandError::IllegalState { .. }),
        "a failing module surfaces illegal state"
    );

    assert_matches!(
        manager.handle(set_value(probe_id(), 9, 1.0)).await,
        Err(CommandError::InvalidAccess { .. }),
        "an unknown module is not reactive"
    );
}

#[tokio::test]
async fn listen_announces_only_unpaired_devices() {
    let Fixture {
        manager, upstream, ..
    } = fixture();

    manager
        .handle(ServerCommand::Listen {
            id: Uuid::new_v4(),
            duration: Duration::from_secs(30),
        })
        .await
        .expect("listen should succeed");

    let sent = upstream.sent.lock().expect("sent lock");
    let announced: Vec<DeviceId> = sent
        .iter()
        .filter_map(|message| match message {
            GwMessage::NewDeviceRequest { description, .. } => Some(description.id()),
            _ => None,
        })
        .collect();
    assert_eq!(vec![probe_id()], announced);
}

#[tokio::test]
async fn remote_status_snapshot_reconciles_pairing_and_schedule() {
    let Fixture { manager, cache, .. } = fixture();

    // Server says: probe paired, plug no longer paired.
    manager.handle_remote_status(&[probe_id()]).await;

    assert!(cache.paired(probe_id()));
    assert!(manager.core().is_scheduled(probe_id()));
    assert!(!cache.paired(plug_id()));
    assert!(!manager.core().is_scheduled(plug_id()));

    // Pairing-schedule coherence: scheduled exactly when paired.
    for id in [probe_id(), plug_id()] {
        assert_eq!(cache.paired(id), manager.core().is_scheduled(id));
    }
}

#[tokio::test]
async fn sync_remote_status_pulls_the_snapshot_from_upstream() {
    let Fixture {
        manager, upstream, ..
    } = fixture();
    *upstream.paired_snapshot.lock().expect("snapshot lock") = vec![probe_id()];

    manager.sync_remote_status().await;

    assert!(manager.core().is_scheduled(probe_id()));
    assert!(!manager.core().is_scheduled(plug_id()));

    let sent = upstream.sent.lock().expect("sent lock");
    assert!(
        sent.iter()
            .any(|message| matches!(message, GwMessage::DeviceListRequest { .. })),
        "sync must request the device list"
    );
}

#[tokio::test]
async fn last_value_is_fetched_from_upstream() {
    let Fixture { manager, .. } = fixture();

    let value = manager
        .core()
        .last_value(probe_id(), ModuleId::new(1))
        .await
        .expect("last value should resolve");

    assert_eq!(42.0, value);
}

#[tokio::test]
async fn routing_accepts_only_matching_prefixes() {
    let Fixture { manager, .. } = fixture();

    assert!(manager.accept(&accept(probe_id())));
    assert!(manager.accept(&ServerCommand::Listen {
        id: Uuid::new_v4(),
        duration: Duration::from_secs(30),
    }));
    assert!(!manager.accept(&accept(DeviceId::new(DevicePrefix::BluetoothLe, 1))));
}
