mod connector;
mod context_pool;
mod output_queue;
mod tls;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::UplinkError;
use crate::message::GwMessage;

pub use self::connector::{LinkState, UplinkConnector};

/// Upstream seam consumed by device managers.
///
/// Lets managers announce devices and request server state without holding
/// a concrete connector, which keeps them testable against a stub.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Queues a message for eventual delivery.
    fn send(&self, message: GwMessage);

    /// Sends a request and waits for the correlated response.
    async fn request(
        &self,
        message: GwMessage,
        timeout: Duration,
    ) -> Result<GwMessage, UplinkError>;
}

#[async_trait]
impl Upstream for UplinkConnector {
    fn send(&self, message: GwMessage) {
        self.send_message(message);
    }

    async fn request(
        &self,
        message: GwMessage,
        timeout: Duration,
    ) -> Result<GwMessage, UplinkError> {
        self.send_and_wait(message, timeout).await
    }
}
