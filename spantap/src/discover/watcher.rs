//! Poll-based process watcher: snapshots PIDs and their listening TCP ports
//! from procfs and emits exactly one Created/Deleted event per transition.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Result;
use log::debug;
use procfs::net::TcpState;
use procfs::process::FDTarget;

use super::{Pid, ProcessAttrs};
use crate::pipe::{Event, Queue};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

type Snapshot = HashMap<Pid, BTreeSet<u16>>;

pub struct ProcessWatcher {
    poll_interval: Duration,
    output: Queue<Vec<Event<ProcessAttrs>>>,
    last: Snapshot,
}

impl ProcessWatcher {
    pub fn new(poll_interval: Duration, output: Queue<Vec<Event<ProcessAttrs>>>) -> Self {
        ProcessWatcher {
            poll_interval,
            output,
            last: Snapshot::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = crate::pipe::shutdown_signal() => break,
            }
            let current = match tokio::task::spawn_blocking(snapshot_processes).await {
                Ok(Ok(snap)) => snap,
                Ok(Err(e)) => {
                    log::warn!("process scan failed: {}. Will retry.", e);
                    continue;
                }
                Err(e) => {
                    log::warn!("process scan task failed: {}", e);
                    continue;
                }
            };

            let events = diff_snapshots(&self.last, &current);
            self.last = current;
            if !events.is_empty() {
                debug!("process watcher emitting {} events", events.len());
                self.output.send(events).await;
            }
        }
    }
}

/// Compare two snapshots. New PIDs and PIDs whose listen-port set changed
/// produce Created events; vanished PIDs produce Deleted events.
fn diff_snapshots(prev: &Snapshot, current: &Snapshot) -> Vec<Event<ProcessAttrs>> {
    let mut events = Vec::new();

    let mut created: Vec<&Pid> = current
        .keys()
        .filter(|pid| prev.get(*pid) != current.get(*pid))
        .collect();
    created.sort_unstable();
    for pid in created {
        events.push(Event::created(ProcessAttrs::new(
            *pid,
            current[pid].iter().copied().collect(),
        )));
    }

    let mut deleted: Vec<&Pid> = prev
        .keys()
        .filter(|pid| !current.contains_key(*pid))
        .collect();
    deleted.sort_unstable();
    for pid in deleted {
        events.push(Event::deleted(ProcessAttrs::new(*pid, Vec::new())));
    }

    events
}

/// Enumerate all processes with their listening TCP ports. Ports are joined
/// to PIDs through the socket inodes exposed in `/proc/<pid>/fd`.
fn snapshot_processes() -> Result<Snapshot> {
    let mut listen_inodes: HashMap<u64, u16> = HashMap::new();
    for entry in procfs::net::tcp()
        .into_iter()
        .flatten()
        .chain(procfs::net::tcp6().into_iter().flatten())
    {
        if entry.state == TcpState::Listen {
            listen_inodes.insert(entry.inode, entry.local_address.port());
        }
    }

    let mut snapshot = Snapshot::new();
    for proc_result in procfs::process::all_processes()? {
        let Ok(process) = proc_result else { continue };
        let pid = process.pid as Pid;
        let mut ports = BTreeSet::new();
        if let Ok(fds) = process.fd() {
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target
                    && let Some(port) = listen_inodes.get(&inode)
                {
                    ports.insert(*port);
                }
            }
        }
        snapshot.insert(pid, ports);
    }

    Ok(snapshot)
}
