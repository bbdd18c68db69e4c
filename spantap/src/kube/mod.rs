//! Orchestrator object metadata: the notifier hub that external informers
//! push into, the latest-snapshot store, and the pod-attribute projection
//! used to enrich discovered processes.

#[cfg(feature = "k8s")]
pub mod informer;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::pipe::Event;

/// Closed set of metadata attribute names attached to discovered processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrName {
    Namespace,
    PodName,
    ReplicaSetName,
    DeploymentName,
    StatefulSetName,
    DaemonSetName,
    OwnerName,
    NodeName,
    ServiceName,
}

impl AttrName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttrName::Namespace => "k8s_namespace",
            AttrName::PodName => "k8s_pod_name",
            AttrName::ReplicaSetName => "k8s_replicaset_name",
            AttrName::DeploymentName => "k8s_deployment_name",
            AttrName::StatefulSetName => "k8s_statefulset_name",
            AttrName::DaemonSetName => "k8s_daemonset_name",
            AttrName::OwnerName => "k8s_owner_name",
            AttrName::NodeName => "k8s_node_name",
            AttrName::ServiceName => "k8s_service_name",
        }
    }
}

impl fmt::Display for AttrName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller that created a pod, from immediate parent up.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Owner {
    pub kind: String,
    pub name: String,
}

/// Pod-specific part of [`ObjectMeta`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodInfo {
    pub uid: String,
    pub node_name: String,
    pub host_ip: String,
    pub start_time: Option<String>,
    pub container_ids: Vec<String>,
    pub owners: Vec<Owner>,
}

/// Orchestrator-level description of a workload object. Immutable once
/// observed; an update replaces the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub pod: Option<PodInfo>,
}

impl ObjectMeta {
    fn store_key(&self) -> (String, String, String) {
        (
            self.namespace.clone(),
            self.name.clone(),
            self.kind.clone(),
        )
    }
}

pub type MetaEvent = Event<Arc<ObjectMeta>>;

const NOTIFY_BUFFER: usize = 32;

/// Fan-out hub for object-metadata events. The external informer calls
/// [`Notifier::notify`]; pipeline stages subscribe with a string ID.
/// Subscribing again under the same ID replaces the prior subscription.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<HashMap<String, mpsc::Sender<MetaEvent>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, id: &str) -> mpsc::Receiver<MetaEvent> {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub async fn notify(&self, event: MetaEvent) {
        let targets: Vec<mpsc::Sender<MetaEvent>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }
}

/// Latest object snapshots keyed by `(namespace, name, kind)`, with a
/// container-id index over pods for PID correlation.
#[derive(Default)]
pub struct Store {
    objects: HashMap<(String, String, String), Arc<ObjectMeta>>,
    pod_by_container: HashMap<String, Arc<ObjectMeta>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the event, replacing any previous snapshot of the same object.
    pub fn apply(&mut self, event: &MetaEvent) {
        let meta = &event.obj;
        match event.kind {
            crate::pipe::EventKind::Deleted => {
                self.objects.remove(&meta.store_key());
                if let Some(pod) = &meta.pod {
                    for cid in &pod.container_ids {
                        self.pod_by_container.remove(cid);
                    }
                }
            }
            _ => {
                if let Some(prev) = self.objects.insert(meta.store_key(), Arc::clone(meta))
                    && let Some(pod) = &prev.pod
                {
                    // A replaced pod may have dropped containers.
                    for cid in &pod.container_ids {
                        self.pod_by_container.remove(cid);
                    }
                }
                if let Some(pod) = &meta.pod {
                    for cid in &pod.container_ids {
                        self.pod_by_container.insert(cid.clone(), Arc::clone(meta));
                    }
                }
            }
        }
    }

    pub fn pod_by_container_id(&self, container_id: &str) -> Option<&Arc<ObjectMeta>> {
        self.pod_by_container.get(container_id)
    }

    pub fn get(&self, namespace: &str, name: &str, kind: &str) -> Option<&Arc<ObjectMeta>> {
        self.objects
            .get(&(namespace.to_string(), name.to_string(), kind.to_string()))
    }
}

/// Project pod fields into the process metadata map.
///
/// Owner chains are traversed from the leaf up: ReplicaSet and
/// ControllerRevision owners land under `k8s_replicaset_name`, while the
/// first owner of any other kind supplies both its kind-specific key and
/// `k8s_owner_name`. Plain pods fall back to the pod name as owner name.
pub fn project_pod_metadata(meta: &ObjectMeta) -> HashMap<AttrName, String> {
    let mut attrs = HashMap::new();
    attrs.insert(AttrName::Namespace, meta.namespace.clone());
    attrs.insert(AttrName::PodName, meta.name.clone());

    let Some(pod) = &meta.pod else {
        attrs.insert(AttrName::OwnerName, meta.name.clone());
        return attrs;
    };

    if !pod.node_name.is_empty() {
        attrs.insert(AttrName::NodeName, pod.node_name.clone());
    }

    let mut owner_name: Option<String> = None;
    for owner in &pod.owners {
        match owner.kind.as_str() {
            "ReplicaSet" | "ControllerRevision" => {
                attrs.insert(AttrName::ReplicaSetName, owner.name.clone());
            }
            "Deployment" => {
                attrs.insert(AttrName::DeploymentName, owner.name.clone());
                owner_name.get_or_insert_with(|| owner.name.clone());
            }
            "StatefulSet" => {
                attrs.insert(AttrName::StatefulSetName, owner.name.clone());
                owner_name.get_or_insert_with(|| owner.name.clone());
            }
            "DaemonSet" => {
                attrs.insert(AttrName::DaemonSetName, owner.name.clone());
                owner_name.get_or_insert_with(|| owner.name.clone());
            }
            _ => {
                owner_name.get_or_insert_with(|| owner.name.clone());
            }
        }
    }

    attrs.insert(AttrName::OwnerName, owner_name.unwrap_or_else(|| meta.name.clone()));
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::EventKind;

    fn owned_pod() -> ObjectMeta {
        ObjectMeta {
            kind: "Pod".into(),
            name: "the-deployment-123456789-abcde".into(),
            namespace: "test-ns".into(),
            pod: Some(PodInfo {
                container_ids: vec!["container-123".into()],
                owners: vec![
                    Owner {
                        kind: "ReplicaSet".into(),
                        name: "the-deployment-123456789".into(),
                    },
                    Owner {
                        kind: "Deployment".into(),
                        name: "the-deployment".into(),
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_chain_projection() {
        let attrs = project_pod_metadata(&owned_pod());
        assert_eq!(attrs[&AttrName::Namespace], "test-ns");
        assert_eq!(attrs[&AttrName::PodName], "the-deployment-123456789-abcde");
        assert_eq!(attrs[&AttrName::ReplicaSetName], "the-deployment-123456789");
        assert_eq!(attrs[&AttrName::DeploymentName], "the-deployment");
        assert_eq!(attrs[&AttrName::OwnerName], "the-deployment");
    }

    #[test]
    fn test_plain_pod_projection_omits_owner_keys() {
        let meta = ObjectMeta {
            kind: "Pod".into(),
            name: "standalone".into(),
            namespace: "test-ns".into(),
            pod: Some(PodInfo::default()),
            ..Default::default()
        };
        let attrs = project_pod_metadata(&meta);
        assert!(!attrs.contains_key(&AttrName::ReplicaSetName));
        assert!(!attrs.contains_key(&AttrName::DeploymentName));
        assert_eq!(attrs[&AttrName::OwnerName], "standalone");
    }

    #[test]
    fn test_statefulset_owner_projection() {
        let meta = ObjectMeta {
            kind: "Pod".into(),
            name: "db-0".into(),
            namespace: "prod".into(),
            pod: Some(PodInfo {
                owners: vec![
                    Owner {
                        kind: "ControllerRevision".into(),
                        name: "db-5d8c9".into(),
                    },
                    Owner {
                        kind: "StatefulSet".into(),
                        name: "db".into(),
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let attrs = project_pod_metadata(&meta);
        assert_eq!(attrs[&AttrName::ReplicaSetName], "db-5d8c9");
        assert_eq!(attrs[&AttrName::StatefulSetName], "db");
        assert_eq!(attrs[&AttrName::OwnerName], "db");
        assert!(!attrs.contains_key(&AttrName::DeploymentName));
    }

    #[test]
    fn test_store_keeps_latest_snapshot() {
        let mut store = Store::new();
        let v1 = Arc::new(owned_pod());
        store.apply(&Event {
            kind: EventKind::Created,
            obj: Arc::clone(&v1),
        });
        assert!(store.pod_by_container_id("container-123").is_some());

        let mut v2 = owned_pod();
        v2.pod.as_mut().unwrap().container_ids = vec!["container-456".into()];
        store.apply(&Event {
            kind: EventKind::Updated,
            obj: Arc::new(v2),
        });
        assert!(store.pod_by_container_id("container-123").is_none());
        assert!(store.pod_by_container_id("container-456").is_some());

        store.apply(&Event {
            kind: EventKind::Deleted,
            obj: Arc::clone(
                store
                    .pod_by_container_id("container-456")
                    .expect("pod present"),
            ),
        });
        assert!(store.pod_by_container_id("container-456").is_none());
        assert!(store.get("test-ns", &v1.name, "Pod").is_none());
    }

    #[tokio::test]
    async fn test_notifier_duplicate_id_replaces() {
        let notifier = Notifier::new();
        let mut first = notifier.subscribe("enricher");
        let mut second = notifier.subscribe("enricher");

        notifier
            .notify(Event {
                kind: EventKind::Created,
                obj: Arc::new(owned_pod()),
            })
            .await;

        assert!(second.recv().await.is_some());
        // The replaced subscription's sender was dropped.
        assert!(first.recv().await.is_none());
    }
}
