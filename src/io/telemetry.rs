// src/io/telemetry.rs - Structured logging for the OIDA loop

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "oida=info";

/// Installs the global subscriber: `RUST_LOG` if set, otherwise
/// [`DEFAULT_FILTER`]; compact lines on stderr so stdout stays clean for
/// CLI output.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
