//! Log and trace setup for the relay
//!
//! Console logs always go through `tracing-subscriber`. When an OTLP endpoint
//! is given, spans are also exported over OTLP (gRPC), so the `trace_id` the
//! transfer engine stamps on each logical operation can be followed end to
//! end.
//!
//! ```text
//! usbd ─► fmt layer ─► stderr
//!      └► OTLP (gRPC) ─► OTel Collector ─► Tempo
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,usbd=debug";

/// Install the global subscriber
///
/// Must run inside a Tokio runtime when `otlp_endpoint` is set, since the
/// batch exporter is driven by it.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![
                        KeyValue::new("service.name", service_name.to_string()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ],
                )))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        otlp_endpoint = otlp_endpoint.unwrap_or("disabled"),
        "Tracing initialized"
    );
    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Span tagged with a caller-supplied trace id
#[macro_export]
macro_rules! span_with_trace {
    ($level:expr, $name:expr, $trace_id:expr) => {
        tracing::span!($level, $name, trace_id = %$trace_id)
    };
}
