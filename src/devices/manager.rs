use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::DeviceCache;
use super::poller::{Distributor, PollingKeeper};
use super::GatewayDevice;
use crate::error::CommandError;
use crate::message::GwMessage;
use crate::model::{DeviceId, DevicePrefix, ModuleId, Reaction};
use crate::uplink::Upstream;

/// Downstream command extracted from the uplink for manager routing.
#[derive(Debug, Clone)]
pub enum ServerCommand {
    Listen {
        id: Uuid,
        duration: Duration,
    },
    Accept {
        id: Uuid,
        device_id: DeviceId,
    },
    Unpair {
        id: Uuid,
        device_id: DeviceId,
    },
    SetValue {
        id: Uuid,
        device_id: DeviceId,
        module_id: ModuleId,
        value: f64,
    },
}

impl ServerCommand {
    /// Extracts a routable command from an uplink message.
    #[must_use]
    pub fn from_message(message: GwMessage) -> Option<Self> {
        match message {
            GwMessage::GatewayListenCommand { id, duration } => {
                Some(Self::Listen { id, duration })
            }
            GwMessage::DeviceAcceptCommand { id, device_id } => {
                Some(Self::Accept { id, device_id })
            }
            GwMessage::DeviceUnpairCommand { id, device_id } => {
                Some(Self::Unpair { id, device_id })
            }
            GwMessage::DeviceSetValueCommand {
                id,
                device_id,
                module_id,
                value,
            } => Some(Self::SetValue {
                id,
                device_id,
                module_id,
                value,
            }),
            _ => None,
        }
    }

    /// Correlation id of the originating message.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::Listen { id, .. }
            | Self::Accept { id, .. }
            | Self::Unpair { id, .. }
            | Self::SetValue { id, .. } => *id,
        }
    }

    /// Target device, when the command addresses one.
    #[must_use]
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            Self::Listen { .. } => None,
            Self::Accept { device_id, .. }
            | Self::Unpair { device_id, .. }
            | Self::SetValue { device_id, .. } => Some(*device_id),
        }
    }
}

/// One driver family's manager as seen by the command router.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Driver family handled by this manager.
    fn prefix(&self) -> DevicePrefix;

    /// Cheap type check deciding whether [`handle`](Self::handle) applies.
    fn accept(&self, command: &ServerCommand) -> bool;

    /// Executes one accepted command.
    async fn handle(&self, command: ServerCommand) -> Result<(), CommandError>;

    /// Reconciles local schedule against a server pairing snapshot.
    async fn handle_remote_status(&self, paired: &[DeviceId]);

    /// Requests the server's pairing snapshot and reconciles. Called after
    /// every successful registration.
    async fn sync_remote_status(&self);

    /// Cancels all scheduled work.
    async fn stop(&self);
}

/// Shared routing and lifecycle logic of device managers.
///
/// Holds one coarse lock over the device map; driver-internal concurrency
/// stays inside the drivers.
pub struct DeviceManagerCore {
    prefix: DevicePrefix,
    cache: Arc<dyn DeviceCache>,
    keeper: PollingKeeper,
    upstream: Arc<dyn Upstream>,
    send_timeout: Duration,
    devices: Mutex<HashMap<DeviceId, Arc<dyn GatewayDevice>>>,
}

impl DeviceManagerCore {
    /// Creates manager internals for one driver family.
    #[must_use]
    pub fn new(
        prefix: DevicePrefix,
        cache: Arc<dyn DeviceCache>,
        distributor: Arc<dyn Distributor>,
        upstream: Arc<dyn Upstream>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            prefix,
            cache,
            keeper: PollingKeeper::new(distributor),
            upstream,
            send_timeout,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the managed driver family.
    #[must_use]
    pub fn prefix(&self) -> DevicePrefix {
        self.prefix
    }

    /// Adds a device to the active map.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::AlreadyRegistered`] for duplicate ids.
    pub fn register_device(&self, device: Arc<dyn GatewayDevice>) -> Result<(), CommandError> {
        let id = device.id();
        let mut devices = self.devices.lock().expect("device map lock poisoned");
        if devices.contains_key(&id) {
            return Err(CommandError::AlreadyRegistered { device: id });
        }
        debug!(device = %id, "registering device");
        devices.insert(id, device);
        Ok(())
    }

    /// Returns a device handle revalidated under the map lock.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn GatewayDevice>> {
        self.devices
            .lock()
            .expect("device map lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Number of devices with an active poll schedule.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.keeper.scheduled_count()
    }

    /// Whether polling is scheduled for a device.
    #[must_use]
    pub fn is_scheduled(&self, id: DeviceId) -> bool {
        self.keeper.is_scheduled(id)
    }

    /// Default `accept`: listen commands concern every family, the rest
    /// are routed by device prefix.
    #[must_use]
    pub fn accepts(&self, command: &ServerCommand) -> bool {
        match command.device_id() {
            None => true,
            Some(id) => id.has_prefix(self.prefix),
        }
    }

    /// Announces every locally-known unpaired device upstream.
    pub async fn handle_listen(&self) -> Result<(), CommandError> {
        let unpaired: Vec<Arc<dyn GatewayDevice>> = {
            let devices = self.devices.lock().expect("device map lock poisoned");
            devices
                .values()
                .filter(|device| !self.cache.paired(device.id()))
                .cloned()
                .collect()
        };

        for device in unpaired {
            let request = GwMessage::NewDeviceRequest {
                id: Uuid::new_v4(),
                description: device.description(),
            };
            match self.upstream.request(request, self.send_timeout).await {
                Ok(_) => debug!(device = %device.id(), "announced new device"),
                Err(error) => {
                    warn!(device = %device.id(), %error, "new-device announcement unanswered");
                }
            }
        }
        Ok(())
    }

    /// Marks a device paired and schedules its polling. Accepting an
    /// already-paired device is idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotFound`] for unknown ids.
    pub fn handle_accept(&self, id: DeviceId) -> Result<(), CommandError> {
        let devices = self.devices.lock().expect("device map lock poisoned");
        let Some(device) = devices.get(&id) else {
            return Err(CommandError::NotFound { device: id });
        };

        if self.cache.paired(id) {
            warn!(device = %id, "ignoring accept for already-paired device");
        }
        self.cache.mark_paired(id);
        self.keeper.schedule(Arc::clone(device));
        Ok(())
    }

    /// Marks a device unpaired and cancels its polling. Unknown ids get a
    /// warning, not an error.
    pub fn handle_unpair(&self, id: DeviceId) {
        let known = {
            let devices = self.devices.lock().expect("device map lock poisoned");
            devices.contains_key(&id)
        };
        if !known {
            warn!(device = %id, "unpairing device that is not registered");
            return;
        }
        if !self.cache.paired(id) {
            warn!(device = %id, "unpairing device that is not paired");
        }
        self.cache.mark_unpaired(id);
        self.keeper.cancel(id);
    }

    /// Applies a set-value command to one module.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] for unknown devices,
    /// [`CommandError::InvalidAccess`] for non-reactive modules, and
    /// whatever the driver raises when the modification fails.
    pub async fn handle_set_value(
        &self,
        id: DeviceId,
        module: ModuleId,
        value: f64,
    ) -> Result<(), CommandError> {
        let device = self
            .device(id)
            .ok_or(CommandError::NotFound { device: id })?;

        match device.reaction_of(module) {
            None | Some(Reaction::None) => {
                return Err(CommandError::InvalidAccess { device: id, module });
            }
            Some(_) => {}
        }

        device.modify_value(module, value).await?;
        debug!(device = %id, %module, value, "module value set");
        Ok(())
    }

    /// Applies a server pairing snapshot: every listed device is marked
    /// paired, every other locally-known one unpaired, and the poll
    /// schedule is reconciled to match.
    ///
    /// A snapshot arriving right after a reconnect overwrites pairing
    /// changes made locally inside the reconnect window.
    pub fn handle_remote_status(&self, paired: &[DeviceId]) {
        let paired: HashSet<DeviceId> = paired.iter().copied().collect();
        let devices: Vec<(DeviceId, Arc<dyn GatewayDevice>)> = {
            let map = self.devices.lock().expect("device map lock poisoned");
            map.iter().map(|(id, device)| (*id, Arc::clone(device))).collect()
        };

        for (id, device) in devices {
            if paired.contains(&id) {
                self.cache.mark_paired(id);
                self.keeper.schedule(device);
            } else {
                self.cache.mark_unpaired(id);
                self.keeper.cancel(id);
            }
        }
        info!(
            prefix = %self.prefix,
            paired = paired.len(),
            "reconciled pairing snapshot"
        );
    }

    /// Fetches the server's paired-device list for this family and
    /// reconciles. Failures are logged; the previous schedule stays.
    pub async fn request_remote_status(&self) {
        let request = GwMessage::DeviceListRequest {
            id: Uuid::new_v4(),
            device_prefix: self.prefix,
        };
        match self.upstream.request(request, self.send_timeout).await {
            Ok(GwMessage::DeviceListResponse { devices, .. }) => {
                self.handle_remote_status(&devices);
            }
            Ok(other) => {
                warn!(correlation_id = %other.id(), "unexpected reply to device-list request");
            }
            Err(error) => {
                warn!(%error, "device-list request failed, keeping local schedule");
            }
        }
    }

    /// Asks the server for the last stored value of one module, e.g. to
    /// restore actuator state after a driver restart.
    ///
    /// # Errors
    ///
    /// Propagates uplink failures; an unexpected reply kind surfaces as a
    /// timeout.
    pub async fn last_value(&self, device: DeviceId, module: ModuleId) -> Result<f64, CommandError> {
        let request = GwMessage::LastValueRequest {
            id: Uuid::new_v4(),
            device_id: device,
            module_id: module,
        };
        match self.upstream.request(request, self.send_timeout).await? {
            GwMessage::LastValueResponse { value, .. } => Ok(value),
            other => {
                warn!(correlation_id = %other.id(), "unexpected reply to last-value request");
                Err(CommandError::Upstream(crate::error::UplinkError::Timeout))
            }
        }
    }

    /// Routes one accepted command to its handler.
    pub async fn dispatch(&self, command: ServerCommand) -> Result<(), CommandError> {
        match command {
            ServerCommand::Listen { .. } => self.handle_listen().await,
            ServerCommand::Accept { device_id, .. } => self.handle_accept(device_id),
            ServerCommand::Unpair { device_id, .. } => {
                self.handle_unpair(device_id);
                Ok(())
            }
            ServerCommand::SetValue {
                device_id,
                module_id,
                value,
                ..
            } => self.handle_set_value(device_id, module_id, value).await,
        }
    }

    /// Cancels every scheduled poll.
    pub fn stop(&self) {
        self.keeper.cancel_all();
    }
}
