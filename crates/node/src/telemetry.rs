//! Telemetry initialization.
//!
//! Installs the tracing subscriber and exposes the Prometheus registry in
//! text form. The transport for either (log shipping, scrape endpoint) is
//! external to the core.

use prometheus::{Encoder, TextEncoder};
use tracing_subscriber::EnvFilter;

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directive when `RUST_LOG` is unset (e.g. "info,meridian=debug").
    pub default_filter: String,
    /// Compact one-line output instead of the full format.
    pub compact: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            compact: true,
        }
    }
}

/// Install the global tracing subscriber. Returns an error message if one
/// is already installed (tests set their own).
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.compact {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| e.to_string())
}

/// Render all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
