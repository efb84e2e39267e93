use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GatewayDevice;
use crate::model::{DeviceId, SensorData};

/// Sink for readings leaving the drivers.
pub trait Distributor: Send + Sync {
    fn ship(&self, data: SensorData);
}

struct ScheduledPoll {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps one poll worker per scheduled device.
///
/// Scheduling an already-scheduled device is a no-op, so reconciliation
/// passes can blindly schedule every paired device.
pub struct PollingKeeper {
    distributor: Arc<dyn Distributor>,
    scheduled: Mutex<HashMap<DeviceId, ScheduledPoll>>,
}

impl PollingKeeper {
    /// Creates a keeper shipping readings into `distributor`.
    #[must_use]
    pub fn new(distributor: Arc<dyn Distributor>) -> Self {
        Self {
            distributor,
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Starts periodic polling for a device. Event-driven devices (no
    /// refresh period) get no worker.
    pub fn schedule(&self, device: Arc<dyn GatewayDevice>) {
        let Some(period) = device.refresh().period() else {
            debug!(device = %device.id(), "device is event-driven, not scheduling");
            return;
        };

        let mut scheduled = self.scheduled.lock().expect("poll schedule lock poisoned");
        if scheduled.contains_key(&device.id()) {
            return;
        }

        let id = device.id();
        debug!(device = %id, period_secs = period.as_secs(), "scheduling poll worker");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_poll_worker(
            device,
            period,
            Arc::clone(&self.distributor),
            cancel.clone(),
        ));
        scheduled.insert(id, ScheduledPoll { cancel, task });
    }

    /// Stops polling a device. Unknown ids are ignored.
    pub fn cancel(&self, id: DeviceId) {
        let entry = {
            let mut scheduled = self.scheduled.lock().expect("poll schedule lock poisoned");
            scheduled.remove(&id)
        };
        if let Some(entry) = entry {
            debug!(device = %id, "cancelling poll worker");
            entry.cancel.cancel();
            entry.task.abort();
        }
    }

    /// Stops every poll worker.
    pub fn cancel_all(&self) {
        let drained: Vec<ScheduledPoll> = {
            let mut scheduled = self.scheduled.lock().expect("poll schedule lock poisoned");
            scheduled.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.cancel.cancel();
            entry.task.abort();
        }
    }

    /// Number of devices currently scheduled.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
            .lock()
            .expect("poll schedule lock poisoned")
            .len()
    }

    /// Whether a device has a poll worker.
    #[must_use]
    pub fn is_scheduled(&self, id: DeviceId) -> bool {
        self.scheduled
            .lock()
            .expect("poll schedule lock poisoned")
            .contains_key(&id)
    }
}

async fn run_poll_worker(
    device: Arc<dyn GatewayDevice>,
    period: std::time::Duration,
    distributor: Arc<dyn Distributor>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => match device.poll().await {
                Ok(data) => distributor.ship(data),
                Err(error) => {
                    warn!(device = %device.id(), %error, "device poll failed");
                }
            }
        }
    }
    debug!(device = %device.id(), "poll worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::CommandError;
    use crate::model::{
        DevicePrefix, ModuleId, ModuleType, ModuleValue, Reaction, RefreshTime,
    };

    #[derive(Default)]
    struct RecordingDistributor {
        shipped: StdMutex<Vec<SensorData>>,
    }

    impl Distributor for RecordingDistributor {
        fn ship(&self, data: SensorData) {
            self.shipped.lock().expect("shipped lock").push(data);
        }
    }

    struct TickingDevice {
        id: DeviceId,
        refresh: RefreshTime,
    }

    #[async_trait]
    impl GatewayDevice for TickingDevice {
        fn id(&self) -> DeviceId {
            self.id
        }

        fn vendor(&self) -> &str {
            "Test"
        }

        fn product(&self) -> &str {
            "Ticker"
        }

        fn module_types(&self) -> Vec<ModuleType> {
            Vec::new()
        }

        fn refresh(&self) -> RefreshTime {
            self.refresh
        }

        fn reaction_of(&self, _module: ModuleId) -> Option<Reaction> {
            None
        }

        async fn poll(&self) -> Result<SensorData, CommandError> {
            Ok(SensorData::new(
                self.id,
                vec![ModuleValue {
                    module: ModuleId::new(0),
                    value: 1.0,
                }],
            ))
        }

        async fn modify_value(&self, _module: ModuleId, _value: f64) -> Result<(), CommandError> {
            Err(CommandError::IllegalState { device: self.id })
        }
    }

    fn device(ident: u64, refresh: RefreshTime) -> Arc<dyn GatewayDevice> {
        Arc::new(TickingDevice {
            id: DeviceId::new(DevicePrefix::VirtualDevice, ident),
            refresh,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_device_ships_readings_each_period() {
        let distributor = Arc::new(RecordingDistributor::default());
        let keeper = PollingKeeper::new(Arc::clone(&distributor) as Arc<dyn Distributor>);
        let target = device(1, RefreshTime::from_secs(5));

        keeper.schedule(Arc::clone(&target));
        keeper.schedule(target);
        assert_eq!(1, keeper.scheduled_count());

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        let shipped = distributor.shipped.lock().expect("shipped lock").len();
        assert!(shipped >= 2, "expected at least two polls, saw {shipped}");

        keeper.cancel_all();
        assert_eq!(0, keeper.scheduled_count());
    }

    #[tokio::test]
    async fn event_driven_devices_are_not_scheduled() {
        let keeper =
            PollingKeeper::new(Arc::new(RecordingDistributor::default()) as Arc<dyn Distributor>);

        keeper.schedule(device(2, RefreshTime::None));

        assert_eq!(0, keeper.scheduled_count());
    }

    #[tokio::test]
    async fn cancel_ignores_unknown_devices() {
        let keeper =
            PollingKeeper::new(Arc::new(RecordingDistributor::default()) as Arc<dyn Distributor>);
        keeper.schedule(device(3, RefreshTime::from_secs(5)));

        keeper.cancel(DeviceId::new(DevicePrefix::VirtualDevice, 99));
        assert_eq!(1, keeper.scheduled_count());

        keeper.cancel(DeviceId::new(DevicePrefix::VirtualDevice, 3));
        assert_eq!(0, keeper.scheduled_count());
    }
}
