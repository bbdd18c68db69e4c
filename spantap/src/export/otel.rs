//! OTLP traces export: endpoint and protocol resolution from config and the
//! `OTEL_EXPORTER_OTLP_*` environment, the per-configuration exporter
//! singleton, and the pipeline stage that turns request spans into OTLP
//! span data.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use once_cell::sync::OnceCell;
use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind as OtelSpanKind, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::export::trace::{SpanData, SpanExporter as _};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator, SpanEvents, SpanLinks};
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use url::Url;

use super::attr_select::{Selection, attribute_allowed};
use crate::span::{RequestSpan, SpanKind};

pub const ENV_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
pub const ENV_TRACES_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_TRACES_PROTOCOL";
pub const ENV_HEADERS: &str = "OTEL_EXPORTER_OTLP_HEADERS";
pub const ENV_TRACES_HEADERS: &str = "OTEL_EXPORTER_OTLP_TRACES_HEADERS";

pub const PROTOCOL_GRPC: &str = "grpc";
pub const PROTOCOL_HTTP_PROTOBUF: &str = "http/protobuf";

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
const EXPORT_BATCH: usize = 512;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TracesConfig {
    /// Endpoint shared by all signals; a `/v1/traces` suffix is appended
    /// for HTTP transport.
    pub common_endpoint: String,
    /// Traces-specific endpoint, used verbatim. Wins over the common one.
    pub traces_endpoint: String,
    pub protocol: String,
    pub traces_protocol: String,
    pub insecure_skip_verify: bool,
}

impl TracesConfig {
    pub fn enabled(&self) -> bool {
        !self.common_endpoint.is_empty() || !self.traces_endpoint.is_empty()
    }

    fn resolved_endpoint(&self) -> &str {
        if self.traces_endpoint.is_empty() {
            &self.common_endpoint
        } else {
            &self.traces_endpoint
        }
    }
}

/// Transport-level connection options derived from one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OtlpOptions {
    pub scheme: String,
    pub endpoint: String,
    pub base_url_path: String,
    pub url_path: String,
    pub insecure: bool,
    pub skip_tls_verify: bool,
    pub headers: HashMap<String, String>,
}

/// Ports ending in 4317 speak OTLP/gRPC by convention; everything else
/// defaults to HTTP/protobuf.
pub fn guess_protocol(endpoint: &str) -> &'static str {
    let authority = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = authority.split(['/', '?']).next().unwrap_or(authority);
    match authority.rsplit_once(':') {
        Some((_, port)) if port.ends_with("4317") => PROTOCOL_GRPC,
        _ => PROTOCOL_HTTP_PROTOBUF,
    }
}

/// Publish the effective protocol to the standard OTEL environment so the
/// rest of the process (and child SDKs) agree with the agent. Variables
/// already set externally are never overwritten.
fn setup_protocol_env(cfg: &TracesConfig) {
    if std::env::var_os(ENV_TRACES_PROTOCOL).is_some()
        || std::env::var_os(ENV_PROTOCOL).is_some()
    {
        return;
    }
    // An explicit trace-specific protocol wins over the common one.
    if !cfg.traces_protocol.is_empty() {
        unsafe { std::env::set_var(ENV_TRACES_PROTOCOL, &cfg.traces_protocol) };
        return;
    }
    if !cfg.protocol.is_empty() {
        unsafe { std::env::set_var(ENV_PROTOCOL, &cfg.protocol) };
        return;
    }
    unsafe {
        std::env::set_var(
            ENV_TRACES_PROTOCOL,
            guess_protocol(cfg.resolved_endpoint()),
        )
    };
}

pub(crate) fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid OTLP endpoint {:?}", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!(
            "unsupported scheme {:?} in OTLP endpoint {:?}",
            other,
            raw
        )),
    }
}

pub(crate) fn authority(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("OTLP endpoint {} has no host", url))?;
    Ok(match url.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// The URL path as the user wrote it: an endpoint without any path yields
/// an empty string, not "/".
pub(crate) fn effective_path(url: &Url, raw: &str) -> String {
    let path = url.path();
    if path == "/" && !raw.trim_end_matches(['?', '#']).ends_with('/') {
        String::new()
    } else {
        path.to_string()
    }
}

/// Connection options for OTLP/HTTP traces. A common endpoint gets the
/// `/v1/traces` signal path appended to its base path; a traces-specific
/// endpoint is taken verbatim.
pub fn http_traces_endpoint_options(cfg: &TracesConfig) -> Result<OtlpOptions> {
    setup_protocol_env(cfg);

    let uses_common = cfg.traces_endpoint.is_empty();
    let raw = cfg.resolved_endpoint();
    if raw.is_empty() {
        return Err(anyhow!("no OTLP traces endpoint configured"));
    }
    let url = parse_endpoint(raw)?;

    let mut opts = OtlpOptions {
        scheme: url.scheme().to_string(),
        endpoint: authority(&url)?,
        insecure: url.scheme() == "http",
        skip_tls_verify: cfg.insecure_skip_verify,
        headers: traces_headers(),
        ..Default::default()
    };

    let path = effective_path(&url, raw);
    if uses_common {
        let base = path.trim_end_matches('/').to_string();
        opts.url_path = format!("{}/v1/traces", base);
        opts.base_url_path = base;
    } else {
        opts.url_path = path;
    }
    Ok(opts)
}

/// Connection options for OTLP/gRPC traces. Only host and port matter;
/// the scheme decides TLS.
pub fn grpc_traces_endpoint_options(cfg: &TracesConfig) -> Result<OtlpOptions> {
    setup_protocol_env(cfg);

    let raw = cfg.resolved_endpoint();
    if raw.is_empty() {
        return Err(anyhow!("no OTLP traces endpoint configured"));
    }
    let url = parse_endpoint(raw)?;
    Ok(OtlpOptions {
        endpoint: authority(&url)?,
        insecure: url.scheme() == "http",
        skip_tls_verify: cfg.insecure_skip_verify,
        headers: traces_headers(),
        ..Default::default()
    })
}

fn parse_headers_into(raw: &str, out: &mut HashMap<String, String>) {
    for part in raw.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                out.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// Headers from the common and traces-specific env vars; the traces
/// variable wins per key.
pub fn traces_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Ok(common) = std::env::var(ENV_HEADERS) {
        parse_headers_into(&common, &mut headers);
    }
    if let Ok(traces) = std::env::var(ENV_TRACES_HEADERS) {
        parse_headers_into(&traces, &mut headers);
    }
    headers
}

fn resolved_protocol(cfg: &TracesConfig) -> String {
    if !cfg.traces_protocol.is_empty() {
        return cfg.traces_protocol.clone();
    }
    if !cfg.protocol.is_empty() {
        return cfg.protocol.clone();
    }
    if let Ok(p) = std::env::var(ENV_TRACES_PROTOCOL) {
        return p;
    }
    if let Ok(p) = std::env::var(ENV_PROTOCOL) {
        return p;
    }
    guess_protocol(cfg.resolved_endpoint()).to_string()
}

fn build_span_exporter(cfg: &TracesConfig) -> Result<SpanExporter> {
    let protocol = resolved_protocol(cfg);
    if protocol == PROTOCOL_GRPC {
        let opts = grpc_traces_endpoint_options(cfg)?;
        let scheme = if opts.insecure { "http" } else { "https" };
        SpanExporter::builder()
            .with_tonic()
            .with_endpoint(format!("{}://{}", scheme, opts.endpoint))
            .with_timeout(EXPORT_TIMEOUT)
            .build()
            .context("building OTLP/gRPC span exporter")
    } else {
        let opts = http_traces_endpoint_options(cfg)?;
        SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}://{}{}", opts.scheme, opts.endpoint, opts.url_path))
            .with_timeout(EXPORT_TIMEOUT)
            .build()
            .context("building OTLP/HTTP span exporter")
    }
}

type SharedSpanExporter = Arc<Mutex<SpanExporter>>;

/// Builds the span exporter for one configuration exactly once: concurrent
/// `instantiate` calls race to initialize and every caller observes the
/// same instance.
pub struct TracesExporterInstancer {
    cfg: TracesConfig,
    instance: OnceCell<SharedSpanExporter>,
}

impl TracesExporterInstancer {
    pub fn new(cfg: TracesConfig) -> Self {
        TracesExporterInstancer {
            cfg,
            instance: OnceCell::new(),
        }
    }

    pub fn instantiate(&self) -> Result<SharedSpanExporter> {
        self.instance
            .get_or_try_init(|| build_span_exporter(&self.cfg).map(|e| Arc::new(Mutex::new(e))))
            .cloned()
    }
}

/// Pipeline stage: consumes request spans, converts them to OTLP span data
/// with the kernel-reported trace identity preserved, and ships batches.
pub struct SpanExportStage {
    instancer: TracesExporterInstancer,
    /// User attribute selection, shared with the metric exporters.
    selection: Arc<Selection>,
    /// Wall-clock nanoseconds of the host boot; kernel timestamps are
    /// monotonic since boot.
    boot_epoch_ns: u64,
}

impl SpanExportStage {
    pub fn new(cfg: TracesConfig, selection: Arc<Selection>) -> Self {
        let boot_epoch_ns = procfs::boot_time()
            .ok()
            .and_then(|boot| boot.timestamp_nanos_opt())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
            as u64;
        SpanExportStage {
            instancer: TracesExporterInstancer::new(cfg),
            selection,
            boot_epoch_ns,
        }
    }

    pub async fn run(self, mut input: mpsc::Receiver<RequestSpan>) {
        let exporter = match self.instancer.instantiate() {
            Ok(exporter) => exporter,
            Err(e) => {
                warn!("traces export disabled: {}", e);
                return;
            }
        };
        info!("OTLP traces exporter ready");

        let id_gen = RandomIdGenerator::default();
        let mut batch: Vec<SpanData> = Vec::with_capacity(EXPORT_BATCH);
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                span = input.recv() => match span {
                    Some(span) => {
                        batch.push(self.to_span_data(&span, &id_gen));
                        if batch.len() >= EXPORT_BATCH {
                            flush(&exporter, &mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        flush(&exporter, &mut batch).await;
                    }
                }
                _ = crate::pipe::shutdown_signal() => break,
            }
        }

        // Final drain of both the channel and the pending batch.
        while let Ok(span) = input.try_recv() {
            batch.push(self.to_span_data(&span, &id_gen));
        }
        if !batch.is_empty() {
            flush(&exporter, &mut batch).await;
        }
    }

    fn to_span_data(&self, span: &RequestSpan, id_gen: &RandomIdGenerator) -> SpanData {
        let trace_id = if span.trace_ctx.is_valid() {
            TraceId::from_bytes(span.trace_ctx.trace_id)
        } else {
            id_gen.new_trace_id()
        };
        let span_id = if span.trace_ctx.is_valid() {
            SpanId::from_bytes(span.trace_ctx.span_id)
        } else {
            id_gen.new_span_id()
        };
        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );

        let mut attributes = span_attributes(span);
        let lists = self.selection.matching(selection_section(span.kind));
        if !lists.is_empty() {
            attributes.retain(|kv| attribute_allowed(&lists, kv.key.as_str()));
        }

        SpanData {
            span_context,
            parent_span_id: SpanId::from_bytes(span.trace_ctx.parent_span_id),
            span_kind: otel_kind(span.kind),
            name: Cow::Owned(span_name(span)),
            start_time: self.wall_time(span.start_ns),
            end_time: self.wall_time(span.end_ns),
            attributes,
            dropped_attributes_count: 0,
            events: SpanEvents::default(),
            links: SpanLinks::default(),
            status: span_status(span),
            instrumentation_scope: InstrumentationScope::builder("spantap")
                .with_version(env!("CARGO_PKG_VERSION"))
                .build(),
        }
    }

    fn wall_time(&self, monotonic_ns: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(self.boot_epoch_ns + monotonic_ns)
    }
}

async fn flush(exporter: &SharedSpanExporter, batch: &mut Vec<SpanData>) {
    let count = batch.len();
    let fut = {
        let mut guard = exporter.lock().await;
        guard.export(std::mem::take(batch))
    };
    match fut.await {
        Ok(()) => super::metrics::record_spans_exported(count as u64),
        Err(e) => warn!("failed to export {} spans: {}", count, e),
    }
}

/// Section name the attribute-selection table keys on for each span kind.
fn selection_section(kind: SpanKind) -> &'static str {
    match kind {
        SpanKind::HttpServer => "http.server.request.duration",
        SpanKind::HttpClient => "http.client.request.duration",
        SpanKind::GrpcServer => "rpc.server.duration",
        SpanKind::GrpcClient => "rpc.client.duration",
        SpanKind::SqlClient => "db.client.operation.duration",
        SpanKind::Tcp => "network.flow.duration",
    }
}

fn otel_kind(kind: SpanKind) -> OtelSpanKind {
    match kind {
        SpanKind::HttpClient | SpanKind::GrpcClient | SpanKind::SqlClient => OtelSpanKind::Client,
        SpanKind::HttpServer | SpanKind::GrpcServer => OtelSpanKind::Server,
        SpanKind::Tcp => OtelSpanKind::Internal,
    }
}

fn span_name(span: &RequestSpan) -> String {
    match span.kind {
        SpanKind::HttpClient | SpanKind::HttpServer => {
            if span.method.is_empty() {
                "HTTP".to_string()
            } else if span.path.is_empty() {
                span.method.clone()
            } else {
                format!("{} {}", span.method, span.path)
            }
        }
        SpanKind::GrpcClient | SpanKind::GrpcServer => {
            if span.path.is_empty() {
                "grpc".to_string()
            } else {
                span.path.clone()
            }
        }
        SpanKind::SqlClient => {
            if span.method.is_empty() {
                "SQL".to_string()
            } else {
                span.method.clone()
            }
        }
        SpanKind::Tcp => "TCP".to_string(),
    }
}

fn span_attributes(span: &RequestSpan) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("service.name", span.service.name.clone()),
        KeyValue::new("service.namespace", span.service.namespace.clone()),
        KeyValue::new("service.instance.id", span.service.instance.clone()),
        KeyValue::new("process.pid", span.pid as i64),
    ];
    if let Some(peer) = span.peer {
        attrs.push(KeyValue::new("network.peer.address", peer.to_string()));
        attrs.push(KeyValue::new("network.peer.port", span.peer_port as i64));
    }
    match span.kind {
        SpanKind::HttpClient | SpanKind::HttpServer => {
            attrs.push(KeyValue::new("http.request.method", span.method.clone()));
            attrs.push(KeyValue::new("url.path", span.path.clone()));
            attrs.push(KeyValue::new("http.response.status_code", span.status as i64));
        }
        SpanKind::GrpcClient | SpanKind::GrpcServer => {
            attrs.push(KeyValue::new("rpc.system", "grpc"));
            attrs.push(KeyValue::new("rpc.method", span.path.clone()));
            attrs.push(KeyValue::new("rpc.grpc.status_code", span.status as i64));
        }
        SpanKind::SqlClient => {
            attrs.push(KeyValue::new("db.system", "postgresql"));
            attrs.push(KeyValue::new("db.operation.name", span.method.clone()));
            if let Some(err) = &span.sql_error {
                attrs.push(KeyValue::new("db.response.status_code", err.sql_state.clone()));
                attrs.push(KeyValue::new("error.message", err.message.clone()));
            }
        }
        SpanKind::Tcp => {
            attrs.push(KeyValue::new("network.transport", "tcp"));
        }
    }
    attrs
}

fn span_status(span: &RequestSpan) -> Status {
    if let Some(err) = &span.sql_error {
        return Status::error(err.message.clone());
    }
    match span.kind {
        SpanKind::HttpClient | SpanKind::HttpServer if span.status >= 500 => {
            Status::error(format!("HTTP {}", span.status))
        }
        SpanKind::GrpcClient | SpanKind::GrpcServer if span.status != 0 => {
            Status::error(format!("grpc status {}", span.status))
        }
        _ => Status::Unset,
    }
}
