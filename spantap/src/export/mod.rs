//! Export-side state and transports: PID/service accounting, attribute
//! selection, agent self-metrics and the OTLP traces stage.

pub mod attr_select;
pub mod metrics;
pub mod otel;
pub mod pid_tracker;
