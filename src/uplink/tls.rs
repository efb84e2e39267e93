//! TLS wrapping of the uplink WebSocket.
//!
//! Mirrors the transport settings used for the plain session: optional CA
//! bundle, optional client identity and a verification switch for
//! self-signed servers. Handshake problems surface as transport failures
//! and feed the reconnect machinery.

use std::fs;

use native_tls::{Certificate, Identity, TlsConnector};
use tokio_tungstenite::Connector;
use tracing::warn;

use crate::config::TlsConfig;

/// Builds the WebSocket connector for the configured TLS mode.
///
/// Returns `None` when TLS is not configured, leaving the session on plain
/// TCP.
pub(crate) fn build_connector(config: Option<&TlsConfig>) -> Result<Option<Connector>, String> {
    let Some(config) = config else {
        return Ok(None);
    };

    let mut builder = TlsConnector::builder();

    if let Some(path) = &config.ca_bundle {
        let pem = fs::read(path).map_err(|error| format!("failed to read CA bundle: {error}"))?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|error| format!("invalid CA bundle: {error}"))?;
        builder.add_root_certificate(certificate);
    }

    if let Some(path) = &config.client_identity {
        let archive =
            fs::read(path).map_err(|error| format!("failed to read client identity: {error}"))?;
        let password = config.identity_password.as_deref().unwrap_or_default();
        let identity = Identity::from_pkcs12(&archive, password)
            .map_err(|error| format!("invalid client identity: {error}"))?;
        builder.identity(identity);
    }

    if config.danger_accept_invalid {
        warn!("TLS certificate verification is disabled");
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    let connector = builder
        .build()
        .map_err(|error| format!("failed to build TLS connector: {error}"))?;
    Ok(Some(Connector::NativeTls(connector)))
}
