//! Agent self-telemetry over OTLP metrics.
//!
//! Metrics ride the common OTLP endpoint with the same scheme/protocol
//! resolution as the traces exporter; a configuration without a common
//! endpoint leaves every record call a no-op.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use super::otel::{
    ENV_PROTOCOL, PROTOCOL_GRPC, TracesConfig, authority, effective_path, guess_protocol,
    parse_endpoint,
};
use crate::span::ServiceUID;

const EXPORT_INTERVAL: Duration = Duration::from_secs(30);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

static METRICS: OnceLock<AgentMetrics> = OnceLock::new();
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Live instrumented-process count per discovery criterion, read by the
/// ObservableGauge callback.
static INSTRUMENTED: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn instrumented_map() -> &'static RwLock<HashMap<String, u64>> {
    INSTRUMENTED.get_or_init(|| RwLock::new(HashMap::new()))
}

// Counter names carry no _total suffix; the collector adds it.
pub struct AgentMetrics {
    pub spans_exported: Counter<u64>,
    pub parse_errors: Counter<u64>,
    pub matched_processes: Counter<u64>,
    pub service_closures: Counter<u64>,
}

impl AgentMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            spans_exported: meter
                .u64_counter("spans_exported")
                .with_description("Request spans shipped to the OTLP endpoint")
                .with_unit("spans")
                .build(),
            parse_errors: meter
                .u64_counter("ringbuf_parse_errors")
                .with_description("Kernel records dropped as malformed")
                .with_unit("records")
                .build(),
            matched_processes: meter
                .u64_counter("matched_processes")
                .with_description("Processes promoted by a discovery criterion")
                .with_unit("processes")
                .build(),
            service_closures: meter
                .u64_counter("service_scope_closures")
                .with_description("Services whose last instrumented PID exited")
                .with_unit("services")
                .build(),
        }
    }
}

/// Where the metric exporter connects, after protocol resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MetricsTransport {
    Grpc { endpoint: String },
    Http { endpoint: String },
}

/// Metrics share the common endpoint only; the traces-specific endpoint
/// never applies to them. Protocol: explicit config, then the standard
/// env, then the port convention.
fn resolve_metrics_transport(cfg: &TracesConfig) -> Result<Option<MetricsTransport>> {
    if cfg.common_endpoint.is_empty() {
        return Ok(None);
    }
    let url = parse_endpoint(&cfg.common_endpoint)?;
    let authority = authority(&url)?;

    let protocol = if !cfg.protocol.is_empty() {
        cfg.protocol.clone()
    } else if let Ok(p) = std::env::var(ENV_PROTOCOL) {
        p
    } else {
        guess_protocol(&cfg.common_endpoint).to_string()
    };

    Ok(Some(if protocol == PROTOCOL_GRPC {
        MetricsTransport::Grpc {
            endpoint: format!("{}://{}", url.scheme(), authority),
        }
    } else {
        let base = effective_path(&url, &cfg.common_endpoint)
            .trim_end_matches('/')
            .to_string();
        MetricsTransport::Http {
            endpoint: format!("{}://{}{}/v1/metrics", url.scheme(), authority, base),
        }
    }))
}

/// Start the periodic OTLP metric export, or leave self-telemetry off when
/// no common endpoint is configured.
pub fn init_metrics(cfg: &TracesConfig) -> Result<()> {
    let Some(transport) = resolve_metrics_transport(cfg)? else {
        info!("no common OTLP endpoint configured; agent self-telemetry disabled");
        return Ok(());
    };

    let exporter = match &transport {
        MetricsTransport::Grpc { endpoint } => {
            info!("agent metrics over OTLP/gRPC towards {}", endpoint);
            MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .with_timeout(EXPORT_TIMEOUT)
                .build()
        }
        MetricsTransport::Http { endpoint } => {
            info!("agent metrics over OTLP/HTTP towards {}", endpoint);
            MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint)
                .with_timeout(EXPORT_TIMEOUT)
                .build()
        }
    }
    .context("building OTLP metric exporter")?;

    let provider = SdkMeterProvider::builder()
        .with_reader(
            PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                .with_interval(EXPORT_INTERVAL)
                .build(),
        )
        .with_resource(Resource::new([
            KeyValue::new("service.name", "spantap"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("spantap");

    let _instrumented_gauge = meter
        .u64_observable_gauge("instrumented_processes")
        .with_description("Currently instrumented processes per criterion")
        .with_unit("processes")
        .with_callback(|observer| {
            if let Ok(by_criterion) = instrumented_map().read() {
                for (criterion, count) in by_criterion.iter() {
                    observer.observe(*count, &[KeyValue::new("criterion", criterion.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(AgentMetrics::new(&meter));
    Ok(())
}

pub fn metrics() -> Option<&'static AgentMetrics> {
    METRICS.get()
}

pub fn record_spans_exported(count: u64) {
    if let Some(m) = metrics() {
        m.spans_exported.add(count, &[]);
    }
}

pub fn record_parse_error(tracer: &str) {
    if let Some(m) = metrics() {
        m.parse_errors.add(1, &[KeyValue::new("tracer", tracer.to_string())]);
    }
}

pub fn record_matched_process(criterion: &str) {
    if let Some(m) = metrics() {
        m.matched_processes
            .add(1, &[KeyValue::new("criterion", criterion.to_string())]);
    }
    if let Ok(mut by_criterion) = instrumented_map().write() {
        *by_criterion.entry(criterion.to_string()).or_insert(0) += 1;
    }
}

pub fn record_unmatched_process(criterion: &str) {
    if let Ok(mut by_criterion) = instrumented_map().write()
        && let Some(count) = by_criterion.get_mut(criterion)
    {
        *count = count.saturating_sub(1);
    }
}

/// Terminal scope-closure signal: the last PID of a service went away.
pub fn record_service_closure(uid: &ServiceUID) {
    if let Some(m) = metrics() {
        m.service_closures.add(
            1,
            &[
                KeyValue::new("service.name", uid.name.clone()),
                KeyValue::new("service.namespace", uid.namespace.clone()),
            ],
        );
    }
}

/// Flush pending metrics and shut the provider down.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        log::warn!("metric provider shutdown failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cfg(common: &str, protocol: &str) -> TracesConfig {
        TracesConfig {
            common_endpoint: common.into(),
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn test_no_common_endpoint_disables_metrics() {
        assert_eq!(resolve_metrics_transport(&cfg("", "")).unwrap(), None);
        // A traces-only configuration keeps self-telemetry off too.
        let traces_only = TracesConfig {
            traces_endpoint: "http://collector:4318".into(),
            ..Default::default()
        };
        assert_eq!(resolve_metrics_transport(&traces_only).unwrap(), None);
        assert!(init_metrics(&TracesConfig::default()).is_ok());
    }

    #[test]
    #[serial]
    fn test_transport_guessed_from_port() {
        unsafe { std::env::remove_var(ENV_PROTOCOL) };
        assert_eq!(
            resolve_metrics_transport(&cfg("http://collector:4317", "")).unwrap(),
            Some(MetricsTransport::Grpc {
                endpoint: "http://collector:4317".into()
            })
        );
        assert_eq!(
            resolve_metrics_transport(&cfg("https://collector:4318", "")).unwrap(),
            Some(MetricsTransport::Http {
                endpoint: "https://collector:4318/v1/metrics".into()
            })
        );
    }

    #[test]
    #[serial]
    fn test_http_transport_keeps_base_path() {
        unsafe { std::env::remove_var(ENV_PROTOCOL) };
        assert_eq!(
            resolve_metrics_transport(&cfg("https://collector:4318/otlp", "")).unwrap(),
            Some(MetricsTransport::Http {
                endpoint: "https://collector:4318/otlp/v1/metrics".into()
            })
        );
    }

    #[test]
    #[serial]
    fn test_explicit_protocol_beats_port_convention() {
        unsafe { std::env::remove_var(ENV_PROTOCOL) };
        assert_eq!(
            resolve_metrics_transport(&cfg("http://collector:9999", PROTOCOL_GRPC)).unwrap(),
            Some(MetricsTransport::Grpc {
                endpoint: "http://collector:9999".into()
            })
        );
    }

    #[test]
    #[serial]
    fn test_protocol_env_applies_when_config_is_silent() {
        unsafe { std::env::set_var(ENV_PROTOCOL, PROTOCOL_GRPC) };
        let resolved = resolve_metrics_transport(&cfg("http://collector:4318", ""));
        unsafe { std::env::remove_var(ENV_PROTOCOL) };
        assert_eq!(
            resolved.unwrap(),
            Some(MetricsTransport::Grpc {
                endpoint: "http://collector:4318".into()
            })
        );
    }

    #[test]
    #[serial]
    fn test_scheme_less_endpoint_is_an_error() {
        assert!(resolve_metrics_transport(&cfg("collector:4317", "")).is_err());
    }

    #[test]
    fn test_instrumented_counts_saturate_at_zero() {
        record_unmatched_process("never-seen");
        record_matched_process("seen");
        record_unmatched_process("seen");
        record_unmatched_process("seen");
        let map = instrumented_map().read().unwrap();
        assert_eq!(map.get("seen"), Some(&0));
        assert_eq!(map.get("never-seen"), None);
    }
}
