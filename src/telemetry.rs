//! Log and trace output of the gateway.
//!
//! The configured gateway identity names the trace service, so several
//! gateways reporting into one collector stay distinguishable. The level
//! and rendering come from the `[telemetry]` config table; `RUST_LOG`
//! still takes precedence over the configured level.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

use crate::config::{IdentityConfig, LogFormat, TelemetryConfig};
use crate::error::TelemetryError;

static TRACING_INITIALISED: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Installs the log subscriber and trace provider once per process.
pub(crate) fn initialise_tracing(
    identity: &IdentityConfig,
    config: &TelemetryConfig,
) -> Result<(), &'static TelemetryError> {
    TRACING_INITIALISED
        .get_or_init(|| initialise_tracing_once(identity, config))
        .as_ref()
        .copied()
}

fn initialise_tracing_once(
    identity: &IdentityConfig,
    config: &TelemetryConfig,
) -> Result<(), TelemetryError> {
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
    let tracer = tracer_provider.tracer(identity.id.clone());
    global::set_tracer_provider(tracer_provider);

    let level_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.clone()));

    tracing_subscriber::registry()
        .with(level_filter)
        .with(log_layer(config.format))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;
    Ok(())
}

fn log_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let pretty = match format {
        LogFormat::Pretty => true,
        LogFormat::Json => false,
        // The daemon logs to stderr; render for humans only when one is
        // watching.
        LogFormat::Auto => io::stderr().is_terminal(),
    };

    if pretty {
        fmt::layer().pretty().with_target(false).boxed()
    } else {
        fmt::layer().json().with_target(false).boxed()
    }
}
