//! Container identity for a PID, parsed out of `/proc/<pid>/cgroup`.
//!
//! Supports cgroup v1, cgroup v2 and systemd-scope layouts:
//! - v2: `0::/kubepods/besteffort/pod<uid>/<64-hex-id>`
//! - v1: `12:memory:/kubepods/besteffort/pod<uid>/<64-hex-id>`
//! - scope: `cri-containerd-<64hex>.scope` or `docker-<64hex>.scope`

use anyhow::{Context, Result, anyhow};

/// Resolved container identity. Many PIDs may share one container ID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    pub container_id: String,
}

/// Look up the container ID for a PID. Fails when the process already exited
/// or does not run inside a recognizable container cgroup; callers treat the
/// failure as non-fatal and let the event through un-enriched.
pub fn container_info_for_pid(pid: u32) -> Result<ContainerInfo> {
    let path = format!("/proc/{}/cgroup", pid);
    let content = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;

    content
        .lines()
        .find_map(container_id_from_cgroup_line)
        .map(|container_id| ContainerInfo { container_id })
        .ok_or_else(|| anyhow!("pid {} has no container cgroup", pid))
}

/// Extract the short (12-char) container ID from a single cgroup line.
fn container_id_from_cgroup_line(line: &str) -> Option<String> {
    // Path portion after "hierarchy-ID:controller-list:"
    let path = line.splitn(3, ':').nth(2)?;

    if !path.contains("kubepods") && !path.contains("docker") && !path.contains("containerd") {
        return None;
    }

    let last_segment = path.rsplit('/').next()?;

    if let Some(inner) = last_segment.strip_suffix(".scope") {
        // systemd/cri scope: the hex ID follows the last '-'
        if let Some(hex_id) = inner.rsplit('-').next()
            && is_container_id(hex_id)
        {
            return Some(hex_id[..12].to_string());
        }
    }

    if is_container_id(last_segment) {
        return Some(last_segment[..12].to_string());
    }

    None
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
