//! Log and span output for the bridge process.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives, `info` when unset or invalid. |
//! | `FLEETLINK_LOG_FORMAT` | `json` for newline-delimited JSON, `pretty` for multi-line, anything else compact. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL; dispatch and cancel spans are exported over OTLP/HTTP when set. |
//!
//! ```rust,no_run
//! let _guard = fleetlink_runtime::init_tracing("fleetlink");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// What [`init_tracing`] installs, resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingSettings {
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TracingSettings {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("FLEETLINK_LOG_FORMAT").ok().as_deref(),
            std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref(),
        )
    }

    fn from_values(format: Option<&str>, endpoint: Option<&str>) -> Self {
        Self {
            format: LogFormat::from_setting(format),
            otlp_endpoint: endpoint
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        }
    }
}

/// Install the global subscriber.  Keep the returned guard alive until exit;
/// dropping it flushes any spans still buffered for the collector.
pub fn init_tracing(service_name: &str) -> TelemetryGuard {
    init_with(service_name, TracingSettings::from_env())
}

pub fn init_with(service_name: &str, settings: TracingSettings) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| otlp_provider(service_name, endpoint));
    let span_export = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));

    let compact = (settings.format == LogFormat::Compact)
        .then(|| tracing_subscriber::fmt::layer().with_target(false).compact());
    let pretty = (settings.format == LogFormat::Pretty)
        .then(|| tracing_subscriber::fmt::layer().with_target(false).pretty());
    let json = (settings.format == LogFormat::Json)
        .then(|| tracing_subscriber::fmt::layer().with_target(false).json());

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(span_export)
        .with(compact)
        .with(pretty)
        .with(json)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[{service_name}] subscriber not installed: {e}");
    }

    TelemetryGuard { provider }
}

/// Owns the span exporter, if one was configured.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("span exporter shutdown failed: {e}");
        }
    }
}

fn otlp_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[{service_name}] OTLP exporter for {endpoint} unavailable: {e}");
            return None;
        }
    };

    // Simple exporter: tracing is installed before the Tokio runtime exists.
    Some(
        SdkTracerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .with_simple_exporter(exporter)
            .build(),
    )
}
