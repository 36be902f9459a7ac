//! Observability setup for hyflow: the tracing subscriber and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
