//! Kubernetes API adapter: watches pods scheduled on this node and replays
//! them into the in-process [`Notifier`] as object-metadata events.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::warn;

use super::{MetaEvent, Notifier, ObjectMeta, Owner, PodInfo};
use crate::pipe::{Event, EventKind};

/// Start the pod watcher background task. Watches pods on the given node and
/// forwards every change to the notifier. The kube watcher retries with
/// backoff on stream errors.
pub async fn start_pod_informer(
    notifier: Notifier,
    node_name: String,
) -> Result<tokio::task::JoinHandle<()>> {
    let client = Client::try_default()
        .await
        .context("Failed to create K8s client (not running in cluster?)")?;

    // Pods are namespaced resources, but we want cluster-wide visibility
    // restricted to this node, so we use Api::all with a field selector.
    let api: Api<Pod> = Api::all(client);
    let watcher_config = watcher::Config {
        field_selector: Some(format!("spec.nodeName={}", node_name)),
        ..Default::default()
    };

    let handle = tokio::spawn(async move {
        let stream = watcher(api, watcher_config);
        tokio::pin!(stream);

        while let Some(event) = stream.next().await {
            if crate::pipe::shutdown_requested() {
                break;
            }
            match event {
                Ok(watcher::Event::InitApply(pod)) => {
                    forward(&notifier, &pod, EventKind::Created).await;
                }
                Ok(watcher::Event::Apply(pod)) => {
                    forward(&notifier, &pod, EventKind::Updated).await;
                }
                Ok(watcher::Event::Delete(pod)) => {
                    forward(&notifier, &pod, EventKind::Deleted).await;
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => {
                    warn!("K8s pod watcher error: {}. Will retry.", e);
                }
            }
        }

        warn!("K8s pod watcher stream ended");
    });

    Ok(handle)
}

async fn forward(notifier: &Notifier, pod: &Pod, kind: EventKind) {
    let Some(meta) = pod_object_meta(pod) else {
        return;
    };
    let event: MetaEvent = Event {
        kind,
        obj: Arc::new(meta),
    };
    notifier.notify(event).await;
}

/// Convert a K8s API pod into the pipeline's metadata snapshot.
fn pod_object_meta(pod: &Pod) -> Option<ObjectMeta> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let owners = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .flat_map(|r| {
            let mut owners = vec![Owner {
                kind: r.kind.clone(),
                name: r.name.clone(),
            }];
            // Deployment-generated ReplicaSets carry a trailing hash segment.
            // The informer only sees the pod, so the Deployment owner is
            // synthesized by stripping that segment. Custom RS names with
            // extra dashes resolve to their longest prefix.
            if r.kind == "ReplicaSet"
                && let Some((prefix, _)) = r.name.rsplit_once('-')
            {
                owners.push(Owner {
                    kind: "Deployment".to_string(),
                    name: prefix.to_string(),
                });
            }
            owners
        })
        .collect();

    let status = pod.status.as_ref();
    Some(ObjectMeta {
        kind: "Pod".to_string(),
        name,
        namespace,
        labels: pod
            .metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        annotations: pod
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        pod: Some(PodInfo {
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            host_ip: status
                .and_then(|s| s.host_ip.clone())
                .unwrap_or_default(),
            start_time: status
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0.to_rfc3339()),
            container_ids: extract_container_ids(pod),
            owners,
        }),
    })
}

/// Extract short (12-char) container IDs from a pod's status.
fn extract_container_ids(pod: &Pod) -> Vec<String> {
    let mut ids = Vec::new();

    if let Some(status) = &pod.status {
        for containers in [&status.container_statuses, &status.init_container_statuses]
            .into_iter()
            .flatten()
        {
            for cs in containers {
                if let Some(cid) = &cs.container_id {
                    // Format: "containerd://<64hex>" or "docker://<64hex>"
                    if let Some(hex_id) = cid.rsplit("://").next()
                        && hex_id.len() >= 12
                    {
                        ids.push(hex_id[..12].to_string());
                    }
                }
            }
        }
    }

    ids
}
