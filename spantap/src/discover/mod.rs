//! Process discovery: watching PIDs and ports, correlating them with
//! containers and pods, and gating them against user selection criteria.

pub mod container;
pub mod kube_enricher;
pub mod matcher;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::kube::AttrName;

pub type Pid = u32;

/// The unit flowing through discovery. `metadata`, `pod_labels` and
/// `pod_annotations` are populated only after both the container ID for the
/// PID and a matching pod have been observed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessAttrs {
    pub pid: Pid,
    pub open_ports: Vec<u16>,
    pub metadata: HashMap<AttrName, String>,
    pub pod_labels: HashMap<String, String>,
    pub pod_annotations: HashMap<String, String>,
}

impl ProcessAttrs {
    pub fn new(pid: Pid, open_ports: Vec<u16>) -> Self {
        ProcessAttrs {
            pid,
            open_ports,
            ..Default::default()
        }
    }

    pub fn attr(&self, name: AttrName) -> Option<&str> {
        self.metadata.get(&name).map(String::as_str)
    }
}

/// Executable-level details, resolved lazily from procfs when a criterion
/// needs them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    pub open_ports: Vec<u16>,
    pub exe_path: PathBuf,
}

/// A process green-lit for instrumentation, with the criterion that let it
/// through.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMatch {
    pub criterion: Arc<matcher::Criterion>,
    pub process: ProcessInfo,
}
