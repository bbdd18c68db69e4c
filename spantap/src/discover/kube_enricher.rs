//! Joins three asynchronous streams — process appear/disappear, container
//! resolutions and pod metadata — into a single enriched process-event
//! stream.
//!
//! Process and pod events may arrive in any order. Whenever both a process
//! and the pod owning its container have been seen, at least one enriched
//! event for that PID is emitted (eventual enrichment).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use tokio::sync::mpsc;

use super::container::{ContainerInfo, container_info_for_pid};
use super::{Pid, ProcessAttrs};
use crate::kube::{MetaEvent, Notifier, ObjectMeta, Store, project_pod_metadata};
use crate::pipe::{Event, EventKind, Queue};

const SUBSCRIBER_ID: &str = "discover.watcher_kube_enricher";

type ContainerLookup = fn(Pid) -> Result<ContainerInfo>;

pub struct WatcherKubeEnricher {
    store: Store,
    container_by_pid: HashMap<Pid, ContainerInfo>,
    process_by_container: HashMap<String, Vec<ProcessAttrs>>,
    container_lookup: ContainerLookup,
    input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
    pods: mpsc::Receiver<MetaEvent>,
    output: Queue<Vec<Event<ProcessAttrs>>>,
}

impl WatcherKubeEnricher {
    pub fn new(
        notifier: &Notifier,
        input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
        output: Queue<Vec<Event<ProcessAttrs>>>,
    ) -> Self {
        Self::with_container_lookup(notifier, input, output, container_info_for_pid)
    }

    /// Same as [`WatcherKubeEnricher::new`] with a replaceable container
    /// lookup, so tests can run without a real `/proc`.
    pub fn with_container_lookup(
        notifier: &Notifier,
        input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
        output: Queue<Vec<Event<ProcessAttrs>>>,
        container_lookup: ContainerLookup,
    ) -> Self {
        WatcherKubeEnricher {
            store: Store::new(),
            container_by_pid: HashMap::new(),
            process_by_container: HashMap::new(),
            container_lookup,
            input,
            pods: notifier.subscribe(SUBSCRIBER_ID),
            output,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                batch = self.input.recv() => match batch {
                    Some(batch) => self.enrich_process_events(batch).await,
                    None => break,
                },
                pod = self.pods.recv() => match pod {
                    Some(pod) => self.enrich_pod_event(pod).await,
                    None => break,
                },
                _ = crate::pipe::shutdown_signal() => break,
            }
        }
    }

    /// Handle a batch of process lifecycle events. Created processes are
    /// related to their container and, when the owning pod is already known,
    /// forwarded enriched; otherwise they pass through untouched.
    pub async fn enrich_process_events(&mut self, batch: Vec<Event<ProcessAttrs>>) {
        let mut out = Vec::with_capacity(batch.len());
        for event in batch {
            match event.kind {
                EventKind::Created | EventKind::Updated => {
                    out.push(Event::created(self.on_new_process(event.obj)));
                }
                EventKind::Deleted => {
                    self.on_process_terminated(event.obj.pid);
                    out.push(event);
                }
            }
        }
        if !out.is_empty() {
            self.output.send(out).await;
        }
    }

    /// Handle a pod metadata event: refresh the snapshot store and re-emit
    /// enriched events for every process already known in its containers.
    pub async fn enrich_pod_event(&mut self, event: MetaEvent) {
        self.store.apply(&event);
        if event.kind == EventKind::Deleted {
            return;
        }
        let Some(pod) = &event.obj.pod else { return };

        let mut out = Vec::new();
        for cid in &pod.container_ids {
            if let Some(procs) = self.process_by_container.get(cid) {
                for attrs in procs {
                    out.push(Event::created(with_pod_metadata(attrs, &event.obj)));
                }
            }
        }
        if !out.is_empty() {
            debug!(
                "pod {}/{} enriched {} known processes",
                event.obj.namespace,
                event.obj.name,
                out.len()
            );
            self.output.send(out).await;
        }
    }

    fn on_new_process(&mut self, attrs: ProcessAttrs) -> ProcessAttrs {
        let info = match (self.container_lookup)(attrs.pid) {
            Ok(info) => info,
            Err(e) => {
                // The process may be gone already, or run outside any
                // container. Not an error: it flows through un-enriched.
                debug!("no container for pid {}: {}", attrs.pid, e);
                return attrs;
            }
        };

        self.container_by_pid.insert(attrs.pid, info.clone());
        let procs = self
            .process_by_container
            .entry(info.container_id.clone())
            .or_default();
        // Port-change re-emissions replace the PID's previous snapshot.
        procs.retain(|p| p.pid != attrs.pid);
        procs.push(attrs.clone());

        match self.store.pod_by_container_id(&info.container_id) {
            Some(meta) => with_pod_metadata(&attrs, meta),
            None => attrs,
        }
    }

    fn on_process_terminated(&mut self, pid: Pid) {
        if let Some(info) = self.container_by_pid.remove(&pid)
            && let Some(procs) = self.process_by_container.get_mut(&info.container_id)
        {
            procs.retain(|p| p.pid != pid);
            if procs.is_empty() {
                self.process_by_container.remove(&info.container_id);
            }
        }
    }
}

/// Project pod fields into a copy of the process attributes.
fn with_pod_metadata(attrs: &ProcessAttrs, meta: &Arc<ObjectMeta>) -> ProcessAttrs {
    let mut enriched = attrs.clone();
    enriched.metadata = project_pod_metadata(meta);
    enriched.pod_labels = meta.labels.clone();
    enriched.pod_annotations = meta.annotations.clone();
    enriched
}
