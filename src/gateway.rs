//! Runtime wiring: uplink ⇄ command router ⇄ device managers.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::devices::{DeviceManager, Distributor, ServerCommand};
use crate::error::CommandError;
use crate::message::{CommandStatus, GwMessage};
use crate::model::SensorData;
use crate::uplink::{LinkState, UplinkConnector};

/// Ships driver readings straight into the uplink queue.
pub struct UplinkDistributor {
    uplink: Arc<UplinkConnector>,
}

impl UplinkDistributor {
    /// Creates a distributor over a connector.
    #[must_use]
    pub fn new(uplink: Arc<UplinkConnector>) -> Self {
        Self { uplink }
    }
}

impl Distributor for UplinkDistributor {
    fn ship(&self, data: SensorData) {
        self.uplink.send_message(GwMessage::SensorData {
            id: Uuid::new_v4(),
            device_id: data.device_id,
            values: data.values,
        });
    }
}

/// The assembled gateway: one uplink, one router, registered managers.
pub struct Gateway {
    uplink: Arc<UplinkConnector>,
    managers: Arc<Vec<Arc<dyn DeviceManager>>>,
    commands: StdMutex<Option<mpsc::UnboundedReceiver<GwMessage>>>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Assembles a gateway from its parts.
    #[must_use]
    pub fn new(
        uplink: Arc<UplinkConnector>,
        managers: Vec<Arc<dyn DeviceManager>>,
        commands: mpsc::UnboundedReceiver<GwMessage>,
    ) -> Self {
        Self {
            uplink,
            managers: Arc::new(managers),
            commands: StdMutex::new(Some(commands)),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Starts the uplink, the command router and the pairing-snapshot
    /// synchroniser.
    pub fn start(&self) {
        let Some(commands) = self
            .commands
            .lock()
            .expect("command receiver lock poisoned")
            .take()
        else {
            return;
        };

        self.uplink.start();

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(tokio::spawn(run_router(
            commands,
            Arc::clone(&self.managers),
            Arc::clone(&self.uplink),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_status_sync(
            Arc::clone(&self.managers),
            Arc::clone(&self.uplink),
            self.cancel.clone(),
        )));
        info!(managers = self.managers.len(), "gateway started");
    }

    /// Stops managers, router and uplink in that order.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for manager in self.managers.iter() {
            manager.stop().await;
        }
        self.uplink.stop().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("gateway stopped");
    }
}

/// Dispatches unsolicited downstream commands to the managers and
/// enqueues the status reply.
async fn run_router(
    mut commands: mpsc::UnboundedReceiver<GwMessage>,
    managers: Arc<Vec<Arc<dyn DeviceManager>>>,
    uplink: Arc<UplinkConnector>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = commands.recv() => match message {
                Some(message) => message,
                None => break,
            }
        };

        let Some(command) = ServerCommand::from_message(message) else {
            continue;
        };
        let correlation_id = command.correlation_id();
        let result = route_command(&managers, command).await;

        let reply = match result {
            Ok(()) => GwMessage::command_response(correlation_id, CommandStatus::Success, None),
            Err(error) => {
                warn!(%correlation_id, %error, "downstream command failed");
                GwMessage::command_response(
                    correlation_id,
                    CommandStatus::Failed,
                    Some(error.to_string()),
                )
            }
        };
        uplink.send_message(reply);
    }
    debug!("command router exiting");
}

async fn route_command(
    managers: &[Arc<dyn DeviceManager>],
    command: ServerCommand,
) -> Result<(), CommandError> {
    // Listen commands concern every family; the rest go to the first
    // manager whose cheap type check accepts them.
    if matches!(command, ServerCommand::Listen { .. }) {
        for manager in managers {
            manager.handle(command.clone()).await?;
        }
        return Ok(());
    }

    if let Some(manager) = managers.iter().find(|manager| manager.accept(&command)) {
        return manager.handle(command).await;
    }

    match command.device_id() {
        Some(device) => Err(CommandError::NotFound { device }),
        None => Ok(()),
    }
}

/// Re-requests the server pairing snapshot after every successful
/// registration, so reconnects reconcile the poll schedule.
async fn run_status_sync(
    managers: Arc<Vec<Arc<dyn DeviceManager>>>,
    uplink: Arc<UplinkConnector>,
    cancel: CancellationToken,
) {
    let mut state = uplink.state();
    loop {
        if *state.borrow_and_update() == LinkState::Ready {
            for manager in managers.iter() {
                manager.sync_remote_status().await;
            }
        }

        // One sync per observed state version: each session announces
        // Ready exactly once.
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("status synchroniser exiting");
}
