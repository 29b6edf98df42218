use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::LoggingConfig;

/// Keeps the span exporter alive; dropping it flushes and shuts it down.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

#[cfg(feature = "otel")]
impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global subscriber. The filter comes from `[logging] filter`,
/// then `RUST_LOG`, then `info`.
pub fn init_tracing(
    service_name: &str,
    logging: &LoggingConfig,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    let env_filter = match logging.filter.as_deref() {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let fmt_layer = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    #[cfg(feature = "otel")]
    if let Some(endpoint) = logging.otel_endpoint.as_deref() {
        use opentelemetry::trace::TracerProvider as _;

        let provider = otel::build_provider(service_name, endpoint)?;
        let tracer = provider.tracer(service_name.to_string());
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
        tracing::debug!(service = service_name, endpoint, "otlp span export enabled");
        return Ok(TelemetryGuard {
            provider: Some(provider),
        });
    }

    registry.try_init()?;
    if cfg!(not(feature = "otel")) && logging.otel_endpoint.is_some() {
        tracing::warn!(
            service = service_name,
            "otel_endpoint configured but built without the `otel` feature"
        );
    }
    Ok(TelemetryGuard::default())
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::global;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    pub(super) fn build_provider(
        service_name: &str,
        endpoint: &str,
    ) -> Result<SdkTracerProvider, Box<dyn std::error::Error>> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint.to_string())
            .build()?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .build();
        global::set_tracer_provider(provider.clone());
        Ok(provider)
    }
}
