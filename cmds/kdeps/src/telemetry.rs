//! Logging and optional trace export.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "kdeps";

/// Not exported by opentelemetry_sdk.
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

/// Keeps the trace pipeline alive; pending spans are flushed when dropped.
///
/// Must be dropped inside the tokio runtime the pipeline was created in.
pub struct TelemetryGuard {
	tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
	fn drop(&mut self) {
		if let Some(provider) = self.tracer_provider.take() {
			if let Err(e) = provider.shutdown() {
				eprintln!("failed to shutdown tracer provider: {e}");
			}
		}
	}
}

/// `--log-level` wins over `RUST_LOG`, which wins over info.
fn filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Install the global subscriber.
///
/// Logs go to stderr, pretty on a terminal and JSON otherwise. Spans are exported over
/// OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` or `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set.
pub fn init(log_level: Option<Level>) -> Result<TelemetryGuard> {
	let fmt_layer = if std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	let tracer_provider = otel_export_enabled()
		.then(tracer_provider)
		.transpose()?;

	let otel_layer = tracer_provider.as_ref().map(|provider| {
		tracing_opentelemetry::layer()
			.with_error_records_to_exceptions(true)
			.with_tracer(provider.tracer(SERVICE_NAME))
	});

	tracing_subscriber::registry()
		.with(filter(log_level))
		.with(fmt_layer)
		.with(otel_layer)
		.try_init()
		.context("installing tracing subscriber")?;

	Ok(TelemetryGuard { tracer_provider })
}

fn tracer_provider() -> Result<SdkTracerProvider> {
	// Resource::builder() picks up OTEL_SERVICE_NAME and OTEL_RESOURCE_ATTRIBUTES.
	let mut resource = Resource::builder();
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource = resource.with_service_name(SERVICE_NAME);
	}

	let exporter = match std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL)
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build(),
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build(),
	}
	.context("building OTLP span exporter")?;

	let provider = SdkTracerProvider::builder()
		.with_resource(resource.build())
		.with_batch_exporter(exporter)
		.build();
	opentelemetry::global::set_tracer_provider(provider.clone());

	Ok(provider)
}
