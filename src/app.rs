use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

use crate::ble::{AdapterManager, BluerBusProvider, FakeBusConfig, FakeBusProvider, FakeHciBus,
    HciBusProvider, ScanFixture};
use crate::config::GatewayConfig;
use crate::devices::{DeviceManager, InMemoryDeviceCache, VirtualDeviceManager,
    VirtualDeviceSettings};
use crate::gateway::{Gateway, UplinkDistributor};
use crate::telemetry;
use crate::uplink::UplinkConnector;

/// Command-line options for the gateway daemon.
#[derive(Debug, Parser)]
#[command(
    name = "fieldgate",
    about = "IoT gateway bridging field devices to a cloud server."
)]
pub struct Args {
    /// Path to the gateway configuration file.
    #[arg(long, default_value = "fieldgate.toml")]
    config: PathBuf,
    /// Uses the fake bluetooth bus with fixture-driven discovery.
    #[arg(long)]
    fake_bluetooth: bool,
    /// Fake scan fixtures in the form `mac|name|rssi;...`.
    #[arg(long, requires = "fake_bluetooth", required_if_eq("fake_bluetooth", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Disables the bluetooth subsystem entirely.
    #[arg(long, conflicts_with = "fake_bluetooth")]
    no_bluetooth: bool,
}

/// Runs the gateway until interrupted.
///
/// # Errors
///
/// Returns an error if configuration loading, tracing initialisation or
/// uplink construction fails. Bluetooth failures are logged and leave the
/// gateway running without the adapter.
pub async fn run(args: Args) -> Result<()> {
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    telemetry::initialise_tracing(&config.gateway, &config.telemetry)
        .map_err(|error| anyhow!(error.to_string()))?;

    let (uplink, command_rx) = UplinkConnector::new(config.uplink.clone(), config.gateway.clone())?;
    let uplink = Arc::new(uplink);
    let distributor = Arc::new(UplinkDistributor::new(Arc::clone(&uplink)));
    let cache = Arc::new(InMemoryDeviceCache::default());

    let mut managers: Vec<Arc<dyn DeviceManager>> = Vec::new();
    if let Some(path) = &config.virtual_devices {
        let manager = VirtualDeviceManager::new(VirtualDeviceSettings {
            cache: Arc::clone(&cache) as Arc<dyn crate::devices::DeviceCache>,
            distributor: Arc::clone(&distributor) as Arc<dyn crate::devices::Distributor>,
            upstream: Arc::clone(&uplink) as Arc<dyn crate::uplink::Upstream>,
            send_timeout: config.uplink.send_timeout,
        });
        manager
            .install_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?;
        managers.push(Arc::new(manager));
    }

    let adapters = start_bluetooth(&args, &config).await;

    let gateway = Gateway::new(Arc::clone(&uplink), managers, command_rx);
    gateway.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("shutdown requested");

    gateway.stop().await;
    if let Some(adapters) = adapters {
        adapters.stop_all().await;
    }
    Ok(())
}

/// Brings the configured adapter up; failures keep the gateway running
/// without bluetooth.
async fn start_bluetooth(args: &Args, config: &GatewayConfig) -> Option<AdapterManager> {
    if args.no_bluetooth {
        info!("bluetooth disabled by flag");
        return None;
    }

    let provider: Arc<dyn HciBusProvider> = if args.fake_bluetooth {
        // clap enforces --fake-scan alongside --fake-bluetooth.
        let Some(fixture) = args.fake_scan.clone() else {
            return None;
        };
        let provider = FakeBusProvider::default();
        provider.insert(FakeHciBus::new(
            FakeBusConfig::builder()
                .adapter_name(config.bluetooth.adapter.clone())
                .scan_fixture(fixture)
                .build(),
        ));
        Arc::new(provider)
    } else {
        match BluerBusProvider::new().await {
            Ok(provider) => Arc::new(provider),
            Err(error) => {
                warn!(%error, "bluetooth bus unavailable, continuing without it");
                return None;
            }
        }
    };

    let manager = AdapterManager::new(provider, config.bluetooth.clone());
    match manager.lookup(&config.bluetooth.adapter).await {
        Ok(adapter) => {
            if let Err(error) = adapter.up().await {
                warn!(%error, adapter = adapter.name(), "failed to bring adapter up");
            }
        }
        Err(error) => {
            warn!(%error, "failed to open the configured adapter");
        }
    }
    Some(manager)
}
