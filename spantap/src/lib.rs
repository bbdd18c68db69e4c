//! spantap: attaches kernel probes to already-running processes and
//! reconstructs application telemetry (HTTP/gRPC/SQL/TCP request spans)
//! without touching the targets.
//!
//! The engine wires a staged pipeline: process watcher → kube enricher →
//! criteria matcher → PID/service tracking, and per-ring forwarders →
//! protocol parsers → OTLP span export.

pub mod discover;
pub mod ebpf;
pub mod export;
pub mod kube;
pub mod pipe;
pub mod protocol;
pub mod settings;
pub mod span;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::task::JoinHandle;

use crate::discover::kube_enricher::WatcherKubeEnricher;
use crate::discover::matcher::CriteriaMatcher;
use crate::discover::watcher::ProcessWatcher;
use crate::discover::{ProcessAttrs, ProcessMatch};
use crate::ebpf::forwarder::{RingBufForwarder, RingBufSource};
use crate::ebpf::registry::{self, TracerKind, TracerRegistry, TracerSpec};
use crate::ebpf::{ParseContext, TrackedPidsFilter};
use crate::export::attr_select::Selection;
use crate::export::otel::SpanExportStage;
use crate::export::pid_tracker::PidServiceTracker;
use crate::kube::Notifier;
use crate::pipe::{DEFAULT_QUEUE_LEN, Event, EventKind, Queue};
use crate::settings::Settings;
use crate::span::{RequestSpan, ServiceUID};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SPAN_QUEUE_LEN: usize = 256;

/// Probe sets this build knows how to drive. Program and map names are the
/// contract with the external bytecode.
const TRACER_SPECS: &[TracerSpec] = &[
    TracerSpec {
        kind: TracerKind::Http,
        ring_map: "HTTP_EVENTS",
        parser: protocol::http1::parse_http_info,
        kprobes: &[
            ("spantap_tcp_sendmsg", "tcp_sendmsg"),
            ("spantap_tcp_recvmsg", "tcp_recvmsg"),
        ],
        tracepoints: &[],
    },
    TracerSpec {
        kind: TracerKind::GenericTcp,
        ring_map: "TCP_EVENTS",
        parser: protocol::parse_record,
        kprobes: &[
            ("spantap_tcp_connect", "tcp_connect"),
            ("spantap_tcp_close", "tcp_close"),
        ],
        tracepoints: &[("spantap_sched_exit", "sched", "sched_process_exit")],
    },
];

fn tracer_name(kind: TracerKind) -> &'static str {
    match kind {
        TracerKind::Http => "http-tracer",
        TracerKind::Grpc => "grpc-tracer",
        TracerKind::Sql => "sql-tracer",
        TracerKind::GenericTcp => "tcp-tracer",
    }
}

pub struct Engine {
    settings: Settings,
    notifier: Notifier,
    tracker: Arc<Mutex<PidServiceTracker>>,
    registry: Arc<TracerRegistry>,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Engine {
            settings,
            notifier: Notifier::new(),
            tracker: Arc::new(Mutex::new(PidServiceTracker::new())),
            registry: Arc::new(TracerRegistry::new()),
        })
    }

    /// Entry point for external metadata informers.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Start every pipeline stage and block until SIGINT/SIGTERM, then
    /// shut down within the grace period.
    pub async fn run(self) -> Result<()> {
        if unsafe { libc::geteuid() } != 0 {
            warn!("not running as root; probe attachment will likely fail");
        }
        export::metrics::init_metrics(&self.settings.otel)?;

        let process_events: Queue<Vec<Event<ProcessAttrs>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let enriched: Queue<Vec<Event<ProcessAttrs>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let matches: Queue<Vec<Event<ProcessMatch>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let spans: Queue<RequestSpan> = Queue::new(SPAN_QUEUE_LEN);

        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        #[cfg(feature = "k8s")]
        if let Some(node) = self.settings.node_name.clone() {
            match kube::informer::start_pod_informer(self.notifier.clone(), node).await {
                Ok(handle) => handles.push(("kube-informer", handle)),
                Err(e) => warn!("Kubernetes metadata disabled: {}", e),
            }
        }

        let enricher = WatcherKubeEnricher::new(
            &self.notifier,
            process_events.subscribe(),
            enriched.clone(),
        );
        let matcher = CriteriaMatcher::new(
            self.settings.discovery.services.clone(),
            self.settings.discovery.exclude_services.clone(),
            enriched.subscribe(),
            matches.clone(),
        );
        let watcher = ProcessWatcher::new(
            Duration::from_secs(self.settings.discovery.poll_interval_secs),
            process_events.clone(),
        );

        handles.push(("enricher", tokio::spawn(enricher.run())));
        handles.push(("matcher", tokio::spawn(matcher.run())));
        handles.push(("process-watcher", tokio::spawn(watcher.run())));
        handles.push((
            "match-tracker",
            tokio::spawn(track_matches(
                matches.subscribe(),
                Arc::clone(&self.tracker),
                Arc::clone(&self.registry),
            )),
        ));

        if self.settings.otel.enabled() {
            let selection = Arc::new(Selection::new(self.settings.attributes.select.clone()));
            selection.normalize();
            let stage = SpanExportStage::new(self.settings.otel.clone(), selection);
            handles.push(("span-exporter", tokio::spawn(stage.run(spans.subscribe()))));
        } else {
            info!("no OTLP endpoint configured; spans stay in-process");
        }

        // The Ebpf handle owns every program and link; keeping it alive
        // until the forwarders drained keeps the probes attached.
        let _bpf = match self.settings.ebpf.resolved_bytecode_path() {
            Some(path) => Some(self.start_forwarders(&path, &spans, &mut handles)?),
            None => {
                info!("no probe set configured; kernel ingestion disabled");
                None
            }
        };

        wait_for_signal().await;
        info!("shutdown requested");
        pipe::request_shutdown();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (name, handle) in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("stage {} did not stop within the grace period", name);
            }
        }
        export::metrics::shutdown_metrics();
        Ok(())
    }

    fn start_forwarders(
        &self,
        path: &str,
        spans: &Queue<RequestSpan>,
        handles: &mut Vec<(&'static str, JoinHandle<()>)>,
    ) -> Result<aya::Ebpf> {
        let mut bpf =
            aya::Ebpf::load_file(path).with_context(|| format!("loading probe set {}", path))?;

        for spec in TRACER_SPECS {
            for (program, target) in spec.kprobes {
                if let Err(e) = registry::attach_kprobe(&mut bpf, program, target) {
                    warn!("{}: {}", program, e);
                }
            }
            for (program, category, name) in spec.tracepoints {
                if let Err(e) = registry::attach_tracepoint(&mut bpf, program, category, name) {
                    warn!("{}: {}", program, e);
                }
            }

            let Some(map) = bpf.take_map(spec.ring_map) else {
                warn!(
                    "probe set has no {} map; skipping {:?} tracer",
                    spec.ring_map, spec.kind
                );
                continue;
            };
            let ring = aya::maps::RingBuf::try_from(map)?;
            let forwarder = RingBufForwarder::new(
                tracer_name(spec.kind),
                self.settings.ebpf.clone(),
                RingBufSource::new(ring),
                ParseContext::new(self.settings.large_buffer.clone()),
                spec.parser,
                Arc::new(TrackedPidsFilter::new(Arc::clone(&self.tracker))),
                Vec::new(),
            );
            handles.push((tracer_name(spec.kind), tokio::spawn(forwarder.run(spans.clone()))));
        }
        Ok(bpf)
    }
}

/// Consume matcher output: bind matched PIDs to service identities, keep
/// the instrumented-library refcounts, and surface the terminal
/// scope-closure signal when a service loses its last PID.
async fn track_matches(
    mut input: tokio::sync::mpsc::Receiver<Vec<Event<ProcessMatch>>>,
    tracker: Arc<Mutex<PidServiceTracker>>,
    registry: Arc<TracerRegistry>,
) {
    let host = hostname();
    let mut libs_by_pid: HashMap<i32, Vec<u64>> = HashMap::new();

    while let Some(batch) = input.recv().await {
        for event in batch {
            let pid = event.obj.process.pid;
            match event.kind {
                EventKind::Created | EventKind::Updated => {
                    let uid = service_uid(&event.obj, &host);
                    info!(
                        "instrumenting pid {} as service {}/{}",
                        pid, uid.namespace, uid.name
                    );
                    tracker
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .add_pid(pid, uid);
                    export::metrics::record_matched_process(event.obj.criterion.get_name());

                    // Reference-count the binary and any TLS libraries it
                    // maps, so probes are attached once per object and
                    // detached when the last user exits.
                    let mut targets: Vec<std::path::PathBuf> = Vec::new();
                    let exe = &event.obj.process.exe_path;
                    if !exe.as_os_str().is_empty() {
                        targets.push(exe.clone());
                    }
                    if let Ok(libs) = registry::find_libraries_for_pids(
                        &[pid as u32],
                        &registry::TLS_LIB_PATTERN,
                    ) {
                        targets.extend(libs);
                    }
                    let ids = libs_by_pid.entry(pid).or_default();
                    for target in targets {
                        let Ok(id) = registry::lib_id_for(&target) else {
                            continue;
                        };
                        if registry.already_instrumented_lib(id) {
                            registry.add_instrumented_lib_ref(id);
                        } else {
                            registry.record_instrumented_lib(id, Vec::new());
                        }
                        ids.push(id);
                    }
                }
                EventKind::Deleted => {
                    let (last, uid) = tracker
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove_pid(pid);
                    export::metrics::record_unmatched_process(event.obj.criterion.get_name());
                    if last {
                        info!(
                            "service {}/{} has no instrumented processes left",
                            uid.namespace, uid.name
                        );
                        export::metrics::record_service_closure(&uid);
                    }
                    for id in libs_by_pid.remove(&pid).unwrap_or_default() {
                        registry.unlink_instrumented_lib(id);
                    }
                }
            }
        }
    }
}

/// Service identity for a matched process: the criterion's name and
/// namespace override anything derived; the executable name is the
/// fallback.
fn service_uid(pm: &ProcessMatch, host: &str) -> ServiceUID {
    let name = if !pm.criterion.name.is_empty() {
        pm.criterion.name.clone()
    } else {
        pm.process
            .exe_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("proc-{}", pm.process.pid))
    };
    ServiceUID {
        name,
        namespace: pm.criterion.namespace.clone(),
        instance: format!("{}:{}", host, pm.process.pid),
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
