//! Gates enriched process events against the user's discovery criteria.
//!
//! Criteria are tested in declaration order and the first match wins.
//! Deletions are forwarded only for PIDs that previously matched, so
//! downstream never sees a Deleted without a prior Created for the same PID.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;

use super::{Pid, ProcessAttrs, ProcessInfo, ProcessMatch};
use crate::kube::AttrName;
use crate::pipe::{Event, EventKind, Queue};

/// Glob predicate (`*` wildcard, case-sensitive).
#[derive(Debug, Clone)]
pub struct GlobAttr(glob::Pattern);

impl GlobAttr {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(GlobAttr(
            glob::Pattern::new(pattern).with_context(|| format!("invalid glob {:?}", pattern))?,
        ))
    }

    pub fn matches(&self, value: &str) -> bool {
        self.0.matches(value)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for GlobAttr {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl<'de> Deserialize<'de> for GlobAttr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        GlobAttr::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Port predicate: one or more ports or inclusive ranges
/// (`80`, `"80-90"`, `"80,443,8000-9000"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCriteria {
    ranges: Vec<(u16, u16)>,
}

impl PortCriteria {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (
                    lo.trim().parse::<u16>()?,
                    hi.trim().parse::<u16>()?,
                ),
                None => {
                    let p = part.parse::<u16>()?;
                    (p, p)
                }
            };
            if lo > hi {
                return Err(anyhow!("invalid port range {:?}", part));
            }
            ranges.push((lo, hi));
        }
        if ranges.is_empty() {
            return Err(anyhow!("empty port criteria {:?}", spec));
        }
        Ok(PortCriteria { ranges })
    }

    pub fn matches_any(&self, ports: &[u16]) -> bool {
        ports
            .iter()
            .any(|p| self.ranges.iter().any(|(lo, hi)| lo <= p && p <= hi))
    }
}

impl<'de> Deserialize<'de> for PortCriteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Port(u16),
            Spec(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Port(p) => Ok(PortCriteria {
                ranges: vec![(p, p)],
            }),
            Raw::Spec(s) => PortCriteria::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// One user-declared selection rule. A process matches iff every present
/// predicate matches. `name` and `namespace` are not predicates: they name
/// the resulting service and its export namespace.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Criterion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub open_ports: Option<PortCriteria>,
    #[serde(default)]
    pub exe_path: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_namespace: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_pod_name: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_deployment_name: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_replicaset_name: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_statefulset_name: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_daemonset_name: Option<GlobAttr>,
    #[serde(default)]
    pub k8s_pod_labels: HashMap<String, GlobAttr>,
    #[serde(default)]
    pub k8s_pod_annotations: HashMap<String, GlobAttr>,
}

impl Criterion {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    fn matches(&self, attrs: &ProcessAttrs, exe_path: Option<&std::path::Path>) -> bool {
        if let Some(ports) = &self.open_ports
            && !ports.matches_any(&attrs.open_ports)
        {
            return false;
        }
        let meta_predicates = [
            (&self.k8s_namespace, AttrName::Namespace),
            (&self.k8s_pod_name, AttrName::PodName),
            (&self.k8s_deployment_name, AttrName::DeploymentName),
            (&self.k8s_replicaset_name, AttrName::ReplicaSetName),
            (&self.k8s_statefulset_name, AttrName::StatefulSetName),
            (&self.k8s_daemonset_name, AttrName::DaemonSetName),
        ];
        for (glob, attr) in meta_predicates {
            if let Some(glob) = glob
                && !attrs.attr(attr).is_some_and(|v| glob.matches(v))
            {
                return false;
            }
        }
        if !globs_match_all(&self.k8s_pod_labels, &attrs.pod_labels) {
            return false;
        }
        if !globs_match_all(&self.k8s_pod_annotations, &attrs.pod_annotations) {
            return false;
        }
        if let Some(glob) = &self.exe_path {
            let Some(path) = exe_path else { return false };
            if !glob.matches(&path.to_string_lossy()) {
                return false;
            }
        }
        true
    }

    fn needs_exe_path(&self) -> bool {
        self.exe_path.is_some()
    }

    /// A criterion that constrains nothing would promote every process on
    /// the host; configuration validation rejects it.
    pub fn has_predicates(&self) -> bool {
        self.open_ports.is_some()
            || self.exe_path.is_some()
            || self.k8s_namespace.is_some()
            || self.k8s_pod_name.is_some()
            || self.k8s_deployment_name.is_some()
            || self.k8s_replicaset_name.is_some()
            || self.k8s_statefulset_name.is_some()
            || self.k8s_daemonset_name.is_some()
            || !self.k8s_pod_labels.is_empty()
            || !self.k8s_pod_annotations.is_empty()
    }
}

/// Every key in the rule must exist in the target with a matching value.
fn globs_match_all(rules: &HashMap<String, GlobAttr>, target: &HashMap<String, String>) -> bool {
    rules
        .iter()
        .all(|(k, glob)| target.get(k).is_some_and(|v| glob.matches(v)))
}

type InfoLookup = fn(&ProcessAttrs) -> Result<ProcessInfo>;

/// Resolve executable details through procfs.
fn process_info(attrs: &ProcessAttrs) -> Result<ProcessInfo> {
    let process = procfs::process::Process::new(attrs.pid as i32)
        .with_context(|| format!("process {} not found", attrs.pid))?;
    Ok(ProcessInfo {
        pid: attrs.pid as i32,
        open_ports: attrs.open_ports.clone(),
        exe_path: process.exe().context("unreadable exe link")?,
    })
}

pub struct CriteriaMatcher {
    criteria: Vec<Arc<Criterion>>,
    excludes: Vec<Arc<Criterion>>,
    /// PIDs currently matched, with the criterion that let them through.
    /// Implements delete gating and at-most-once promotion per PID.
    matched: HashMap<Pid, Arc<Criterion>>,
    info_lookup: InfoLookup,
    input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
    output: Queue<Vec<Event<ProcessMatch>>>,
}

impl CriteriaMatcher {
    pub fn new(
        criteria: Vec<Criterion>,
        excludes: Vec<Criterion>,
        input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
        output: Queue<Vec<Event<ProcessMatch>>>,
    ) -> Self {
        Self::with_info_lookup(criteria, excludes, input, output, process_info)
    }

    pub fn with_info_lookup(
        criteria: Vec<Criterion>,
        excludes: Vec<Criterion>,
        input: mpsc::Receiver<Vec<Event<ProcessAttrs>>>,
        output: Queue<Vec<Event<ProcessMatch>>>,
        info_lookup: InfoLookup,
    ) -> Self {
        CriteriaMatcher {
            criteria: criteria.into_iter().map(Arc::new).collect(),
            excludes: excludes.into_iter().map(Arc::new).collect(),
            matched: HashMap::new(),
            info_lookup,
            input,
            output,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                batch = self.input.recv() => match batch {
                    Some(batch) => {
                        let out: Vec<Event<ProcessMatch>> = batch
                            .into_iter()
                            .filter_map(|ev| self.filter_event(ev))
                            .collect();
                        if !out.is_empty() {
                            self.output.send(out).await;
                        }
                    }
                    None => break,
                },
                _ = crate::pipe::shutdown_signal() => break,
            }
        }
    }

    fn filter_event(&mut self, event: Event<ProcessAttrs>) -> Option<Event<ProcessMatch>> {
        match event.kind {
            EventKind::Created | EventKind::Updated => self.on_process_event(event.obj),
            EventKind::Deleted => self.on_process_deleted(event.obj.pid),
        }
    }

    fn on_process_event(&mut self, attrs: ProcessAttrs) -> Option<Event<ProcessMatch>> {
        // A PID is promoted at most once; later enriched re-emissions of an
        // already-matched process are not re-announced.
        if self.matched.contains_key(&attrs.pid) {
            return None;
        }

        let needs_exe = self
            .criteria
            .iter()
            .chain(self.excludes.iter())
            .any(|c| c.needs_exe_path());
        let info = if needs_exe {
            (self.info_lookup)(&attrs).ok()
        } else {
            None
        };
        let exe_path = info.as_ref().map(|i| i.exe_path.as_path());

        if self.excludes.iter().any(|c| c.matches(&attrs, exe_path)) {
            return None;
        }

        let criterion = self
            .criteria
            .iter()
            .find(|c| c.matches(&attrs, exe_path))?
            .clone();

        debug!(
            "pid {} matched discovery criterion {:?}",
            attrs.pid,
            criterion.get_name()
        );
        self.matched.insert(attrs.pid, Arc::clone(&criterion));

        let process = info.unwrap_or_else(|| ProcessInfo {
            pid: attrs.pid as i32,
            open_ports: attrs.open_ports.clone(),
            exe_path: Default::default(),
        });
        Some(Event::created(ProcessMatch { criterion, process }))
    }

    fn on_process_deleted(&mut self, pid: Pid) -> Option<Event<ProcessMatch>> {
        // Deletions of never-matched PIDs are silently dropped.
        let criterion = self.matched.remove(&pid)?;
        Some(Event::deleted(ProcessMatch {
            criterion,
            process: ProcessInfo {
                pid: pid as i32,
                ..Default::default()
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::container::ContainerInfo;
    use crate::discover::kube_enricher::WatcherKubeEnricher;
    use crate::kube::{Notifier, ObjectMeta, Owner, PodInfo};
    use crate::pipe::DEFAULT_QUEUE_LEN;
    use std::time::Duration;
    use tokio::time::timeout;

    const NAMESPACE: &str = "test-ns";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn criteria_from_yaml(yaml: &str) -> Vec<Criterion> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap();
        cfg.get::<Vec<Criterion>>("services").unwrap()
    }

    fn test_criteria() -> Vec<Criterion> {
        criteria_from_yaml(
            r#"
services:
  - name: port-only
    namespace: foo
    open_ports: 80
  - name: metadata-only
    k8s_pod_name: chichi
  - name: both
    open_ports: 443
    k8s_deployment_name: "chacha*"
  - name: pod-label-only
    k8s_pod_labels:
      instrument: "spantap"
  - name: pod-multi-label-only
    k8s_pod_labels:
      instrument: "ebpf"
      lang: "go*"
  - name: pod-annotation-only
    k8s_pod_annotations:
      deploy.type: "canary"
  - name: pod-multi-annotation-only
    k8s_pod_annotations:
      deploy.type: "prod"
      version: "v[0-9]*"
"#,
        )
    }

    fn fake_container_info(pid: Pid) -> Result<ContainerInfo> {
        Ok(ContainerInfo {
            container_id: format!("container-{}", pid),
        })
    }

    fn fake_process_info(attrs: &ProcessAttrs) -> Result<ProcessInfo> {
        Ok(ProcessInfo {
            pid: attrs.pid as i32,
            open_ports: attrs.open_ports.clone(),
            exe_path: format!("/bin/process{}", attrs.pid).into(),
        })
    }

    struct Fixture {
        notifier: Notifier,
        input: mpsc::Sender<Vec<Event<ProcessAttrs>>>,
        matches: mpsc::Receiver<Vec<Event<ProcessMatch>>>,
    }

    /// Wire enricher -> matcher the way the discovery pipeline does.
    fn start_pipeline() -> Fixture {
        let notifier = Notifier::new();
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_QUEUE_LEN);
        let connect: Queue<Vec<Event<ProcessAttrs>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let output: Queue<Vec<Event<ProcessMatch>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let matches = output.subscribe();

        let enricher = WatcherKubeEnricher::with_container_lookup(
            &notifier,
            input_rx,
            connect.clone(),
            fake_container_info,
        );
        let matcher = CriteriaMatcher::with_info_lookup(
            test_criteria(),
            vec![],
            connect.subscribe(),
            output,
            fake_process_info,
        );
        tokio::spawn(enricher.run());
        tokio::spawn(matcher.run());

        Fixture {
            notifier,
            input: input_tx,
            matches,
        }
    }

    async fn new_process(fx: &Fixture, pid: Pid, ports: Vec<u16>) {
        fx.input
            .send(vec![Event::created(ProcessAttrs::new(pid, ports))])
            .await
            .unwrap();
    }

    async fn deploy_pod(
        fx: &Fixture,
        name: &str,
        container_id: &str,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) {
        fx.notifier
            .notify(Event::created(Arc::new(ObjectMeta {
                kind: "Pod".into(),
                name: name.into(),
                namespace: NAMESPACE.into(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                annotations: annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                pod: Some(PodInfo {
                    container_ids: vec![container_id.into()],
                    ..Default::default()
                }),
            })))
            .await;
    }

    async fn deploy_owned_pod(fx: &Fixture, name: &str, rs: &str, deploy: &str, cid: &str) {
        fx.notifier
            .notify(Event::created(Arc::new(ObjectMeta {
                kind: "Pod".into(),
                name: name.into(),
                namespace: NAMESPACE.into(),
                pod: Some(PodInfo {
                    container_ids: vec![cid.into()],
                    owners: vec![
                        Owner {
                            kind: "ReplicaSet".into(),
                            name: rs.into(),
                        },
                        Owner {
                            kind: "Deployment".into(),
                            name: deploy.into(),
                        },
                    ],
                    ..Default::default()
                }),
                ..Default::default()
            })))
            .await;
    }

    async fn read_matches(fx: &mut Fixture) -> Vec<Event<ProcessMatch>> {
        timeout(TIMEOUT, fx.matches.recv())
            .await
            .expect("timed out waiting for matcher output")
            .expect("matcher output closed")
    }

    fn assert_single_match(
        matches: &[Event<ProcessMatch>],
        criterion: &str,
        pid: i32,
    ) {
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, EventKind::Created);
        assert_eq!(matches[0].obj.criterion.get_name(), criterion);
        assert_eq!(matches[0].obj.process.pid, pid);
    }

    #[tokio::test]
    async fn test_matcher_with_enricher() {
        let mut fx = start_pipeline();

        // Events that match no criterion must not be forwarded ahead of the
        // matched ones below.
        new_process(&fx, 123, vec![777]).await;
        new_process(&fx, 456, vec![]).await;
        new_process(&fx, 789, vec![443]).await;
        deploy_owned_pod(&fx, "depl-rsid-podid", "depl-rsid", "depl", "container-789").await;

        // port-only
        new_process(&fx, 12, vec![80]).await;
        assert_single_match(&read_matches(&mut fx).await, "port-only", 12);

        // metadata-only
        new_process(&fx, 34, vec![8080]).await;
        deploy_pod(&fx, "chichi", "container-34", &[], &[]).await;
        assert_single_match(&read_matches(&mut fx).await, "metadata-only", 34);

        // pod-label-only
        new_process(&fx, 42, vec![8080]).await;
        deploy_pod(&fx, "labeltest", "container-42", &[("instrument", "spantap")], &[]).await;
        assert_single_match(&read_matches(&mut fx).await, "pod-label-only", 42);

        // pod-multi-label-only
        new_process(&fx, 43, vec![8080]).await;
        deploy_pod(
            &fx,
            "multi-labeltest",
            "container-43",
            &[("instrument", "ebpf"), ("lang", "golang")],
            &[],
        )
        .await;
        assert_single_match(&read_matches(&mut fx).await, "pod-multi-label-only", 43);

        // pod-annotation-only
        new_process(&fx, 44, vec![8080]).await;
        deploy_pod(
            &fx,
            "annotationtest",
            "container-44",
            &[],
            &[("deploy.type", "canary")],
        )
        .await;
        assert_single_match(&read_matches(&mut fx).await, "pod-annotation-only", 44);

        // pod-multi-annotation-only
        new_process(&fx, 45, vec![8080]).await;
        deploy_pod(
            &fx,
            "multi-annotationtest",
            "container-45",
            &[],
            &[("deploy.type", "prod"), ("version", "v1")],
        )
        .await;
        assert_single_match(&read_matches(&mut fx).await, "pod-multi-annotation-only", 45);

        // both process and metadata
        new_process(&fx, 56, vec![443]).await;
        deploy_owned_pod(&fx, "chacha-rsid-podid", "chacha-rsid", "chacha", "container-56").await;
        assert_single_match(&read_matches(&mut fx).await, "both", 56);

        // Mass deletion: only the seven previously matched PIDs are
        // forwarded, in input order.
        let all = [123u32, 456, 789, 1011, 12, 34, 42, 43, 44, 45, 56];
        fx.input
            .send(
                all.iter()
                    .map(|pid| Event::deleted(ProcessAttrs::new(*pid, vec![])))
                    .collect(),
            )
            .await
            .unwrap();

        let deletions = read_matches(&mut fx).await;
        let expected: Vec<i32> = vec![12, 34, 42, 43, 44, 45, 56];
        assert_eq!(deletions.len(), expected.len());
        for (event, pid) in deletions.iter().zip(&expected) {
            assert_eq!(event.kind, EventKind::Deleted);
            assert_eq!(event.obj.process.pid, *pid);
        }
    }

    #[tokio::test]
    async fn test_exclude_criteria_veto_promotion() {
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_QUEUE_LEN);
        let output: Queue<Vec<Event<ProcessMatch>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let mut matches = output.subscribe();

        let includes = criteria_from_yaml(
            "services:\n  - name: any-port\n    open_ports: 1-65535\n",
        );
        let excludes = criteria_from_yaml(
            "services:\n  - name: not-8080\n    open_ports: 8080\n",
        );
        let matcher = CriteriaMatcher::with_info_lookup(
            includes,
            excludes,
            input_rx,
            output,
            fake_process_info,
        );
        tokio::spawn(matcher.run());

        input_tx
            .send(vec![
                Event::created(ProcessAttrs::new(1, vec![8080])),
                Event::created(ProcessAttrs::new(2, vec![3000])),
            ])
            .await
            .unwrap();

        let out = timeout(TIMEOUT, matches.recv()).await.unwrap().unwrap();
        assert_single_match(&out, "any-port", 2);
    }

    #[tokio::test]
    async fn test_exe_path_glob() {
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_QUEUE_LEN);
        let output: Queue<Vec<Event<ProcessMatch>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let mut matches = output.subscribe();

        let includes =
            criteria_from_yaml("services:\n  - name: by-path\n    exe_path: \"/bin/process7*\"\n");
        let matcher =
            CriteriaMatcher::with_info_lookup(includes, vec![], input_rx, output, fake_process_info);
        tokio::spawn(matcher.run());

        input_tx
            .send(vec![
                Event::created(ProcessAttrs::new(62, vec![])),
                Event::created(ProcessAttrs::new(71, vec![])),
            ])
            .await
            .unwrap();

        let out = timeout(TIMEOUT, matches.recv()).await.unwrap().unwrap();
        assert_single_match(&out, "by-path", 71);
    }

    #[tokio::test]
    async fn test_first_matching_criterion_wins() {
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_QUEUE_LEN);
        let output: Queue<Vec<Event<ProcessMatch>>> = Queue::new(DEFAULT_QUEUE_LEN);
        let mut matches = output.subscribe();

        // Both criteria match a process listening on 80; declaration order
        // decides.
        let includes = criteria_from_yaml(
            "services:\n  - name: narrow\n    open_ports: 80\n  - name: wide\n    open_ports: 1-1024\n",
        );
        let matcher =
            CriteriaMatcher::with_info_lookup(includes, vec![], input_rx, output, fake_process_info);
        tokio::spawn(matcher.run());

        input_tx
            .send(vec![Event::created(ProcessAttrs::new(9, vec![80]))])
            .await
            .unwrap();

        let out = timeout(TIMEOUT, matches.recv()).await.unwrap().unwrap();
        assert_single_match(&out, "narrow", 9);
    }

    #[test]
    fn test_port_criteria_parsing() {
        let pc = PortCriteria::parse("80,443,8000-9000").unwrap();
        assert!(pc.matches_any(&[80]));
        assert!(pc.matches_any(&[443]));
        assert!(pc.matches_any(&[8500]));
        assert!(!pc.matches_any(&[7999]));
        assert!(!pc.matches_any(&[]));

        assert!(PortCriteria::parse("90-80").is_err());
        assert!(PortCriteria::parse("").is_err());
        assert!(PortCriteria::parse("not-a-port").is_err());
    }
}
