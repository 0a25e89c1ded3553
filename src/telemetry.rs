use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::TelemetryError;

const DEFAULT_DIRECTIVE: &str = "warn";

static SUBSCRIBER: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Installs the process-wide subscriber: stderr logs plus an OpenTelemetry span layer.
///
/// The first caller wins. A replay run inside a test binary calls this once per test,
/// so later calls just report how the first one went.
pub(crate) fn initialise_tracing(
    service_name: &str,
    interactive_terminal: bool,
    level_override: Option<LevelFilter>,
) -> Result<(), &'static TelemetryError> {
    SUBSCRIBER
        .get_or_init(|| install(service_name, interactive_terminal, level_override))
        .as_ref()
        .copied()
}

fn install(
    service_name: &str,
    interactive_terminal: bool,
    level_override: Option<LevelFilter>,
) -> Result<(), TelemetryError> {
    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();
    let tracer = provider.tracer(service_name.to_owned());
    global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(stderr_layer(interactive_terminal).with_filter(log_filter(level_override)))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;
    Ok(())
}

/// Human-readable events on a terminal, one JSON object per line otherwise.
fn stderr_layer(interactive_terminal: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if interactive_terminal {
        layer.pretty().boxed()
    } else {
        layer.json().boxed()
    }
}

fn log_filter(level_override: Option<LevelFilter>) -> EnvFilter {
    match level_override {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}
