use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{DeviceDescription, DeviceId, DevicePrefix, ModuleId, ModuleValue};

/// Errors returned when framing or unframing uplink messages.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to decode uplink frame")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode uplink frame")]
    Encode(#[source] serde_json::Error),
    #[error("frame of {size} bytes exceeds the {limit}-byte receive limit")]
    Oversized { size: usize, limit: usize },
}

/// Outcome carried by a [`GwMessage::CommandResponse`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Accepted,
    Success,
    Failed,
}

/// One framed message exchanged with the server.
///
/// Frames are JSON text; the server defines the payload encodings and the
/// gateway passes them through, distinguishing kinds only for routing and
/// extracting the correlation id.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GwMessage {
    Register {
        id: Uuid,
        gateway_id: String,
        version: String,
    },
    RegisterAck {
        id: Uuid,
    },
    SensorData {
        id: Uuid,
        device_id: DeviceId,
        values: Vec<ModuleValue>,
    },
    DeviceListRequest {
        id: Uuid,
        device_prefix: DevicePrefix,
    },
    DeviceListResponse {
        id: Uuid,
        devices: Vec<DeviceId>,
    },
    LastValueRequest {
        id: Uuid,
        device_id: DeviceId,
        module_id: ModuleId,
    },
    LastValueResponse {
        id: Uuid,
        value: f64,
    },
    DeviceAcceptCommand {
        id: Uuid,
        device_id: DeviceId,
    },
    DeviceUnpairCommand {
        id: Uuid,
        device_id: DeviceId,
    },
    DeviceSetValueCommand {
        id: Uuid,
        device_id: DeviceId,
        module_id: ModuleId,
        value: f64,
    },
    GatewayListenCommand {
        id: Uuid,
        #[serde_as(as = "DurationSeconds<u64>")]
        duration: Duration,
    },
    NewDeviceRequest {
        id: Uuid,
        description: DeviceDescription,
    },
    NewDeviceResponse {
        id: Uuid,
        accepted: bool,
    },
    CommandResponse {
        id: Uuid,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        id: Uuid,
    },
}

impl GwMessage {
    /// Returns the correlation id tying a request to its response.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Register { id, .. }
            | Self::RegisterAck { id }
            | Self::SensorData { id, .. }
            | Self::DeviceListRequest { id, .. }
            | Self::DeviceListResponse { id, .. }
            | Self::LastValueRequest { id, .. }
            | Self::LastValueResponse { id, .. }
            | Self::DeviceAcceptCommand { id, .. }
            | Self::DeviceUnpairCommand { id, .. }
            | Self::DeviceSetValueCommand { id, .. }
            | Self::GatewayListenCommand { id, .. }
            | Self::NewDeviceRequest { id, .. }
            | Self::NewDeviceResponse { id, .. }
            | Self::CommandResponse { id, .. }
            | Self::Ping { id } => *id,
        }
    }

    /// Returns whether this kind answers a request the gateway issued.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::RegisterAck { .. }
                | Self::DeviceListResponse { .. }
                | Self::LastValueResponse { .. }
                | Self::NewDeviceResponse { .. }
        )
    }

    /// Returns whether this kind is an unsolicited downstream command.
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::DeviceAcceptCommand { .. }
                | Self::DeviceUnpairCommand { .. }
                | Self::DeviceSetValueCommand { .. }
                | Self::GatewayListenCommand { .. }
        )
    }

    /// Returns whether the output queue must never drop this message.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Register { .. } | Self::CommandResponse { .. })
    }

    /// Builds a command reply reusing the command's correlation id.
    #[must_use]
    pub fn command_response(id: Uuid, status: CommandStatus, reason: Option<String>) -> Self {
        Self::CommandResponse { id, status, reason }
    }

    /// Encodes the message as one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] when serialization fails.
    pub fn to_frame(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    /// Decodes one text frame, enforcing the receive-size limit.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Oversized`] for frames beyond `limit` bytes and
    /// [`FrameError::Decode`] for malformed payloads.
    pub fn from_frame(frame: &str, limit: usize) -> Result<Self, FrameError> {
        if frame.len() > limit {
            return Err(FrameError::Oversized {
                size: frame.len(),
                limit,
            });
        }
        serde_json::from_str(frame).map_err(FrameError::Decode)
    }
}
