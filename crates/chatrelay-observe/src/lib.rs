//! Observability for chatrelay: tracing subscriber setup with optional JSON
//! output and OpenTelemetry span export.

pub mod tracing_setup;
