//! Binds target binaries to probe sets and tracks instrumented shared
//! objects so probes are attached and detached exactly once per library.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::programs::{KProbe, TracePoint, UProbe};
use log::{info, warn};

use super::forwarder::Closer;
use super::SpanParser;

/// Closed set of tracer flavors. Each binds one ring-buffer map to one
/// parse function; there is no open-ended dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracerKind {
    Http,
    Grpc,
    Sql,
    GenericTcp,
}

/// Static description of a tracer: the probes it needs, which map it
/// drains and how records are decoded.
pub struct TracerSpec {
    pub kind: TracerKind,
    pub ring_map: &'static str,
    pub parser: SpanParser,
    /// `(program, attach target)` kprobe pairs; each entry attaches both
    /// entry and return sides when the program names exist.
    pub kprobes: &'static [(&'static str, &'static str)],
    /// `(program, category, name)` tracepoints.
    pub tracepoints: &'static [(&'static str, &'static str, &'static str)],
}

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

/// Attach a tracepoint program, skipping kernels that lack the event.
/// Returns whether the probe is live.
pub fn attach_tracepoint(
    bpf: &mut Ebpf,
    program_name: &str,
    category: &str,
    name: &str,
) -> Result<bool> {
    if !tracepoint_exists(category, name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            category, name, program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", program_name);
    let program: &mut TracePoint = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    if program.fd().is_err() {
        program.load()?;
    }
    program
        .attach(category, name)
        .with_context(|| format!("Failed to attach {}", name))?;
    Ok(true)
}

pub fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, target: &str) -> Result<()> {
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()
        .context("Program is not a KProbe")?;
    if program.fd().is_err() {
        program.load()?;
    }
    program
        .attach(target, 0)
        .with_context(|| format!("Failed to attach {} to {}", program_name, target))?;
    info!("Attached kprobe {} to {}", program_name, target);
    Ok(())
}

/// Attach a uprobe to a symbol of a target binary or shared library.
pub fn attach_uprobe(bpf: &mut Ebpf, program_name: &str, symbol: &str, path: &str) -> Result<()> {
    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find program {}", program_name))?
        .try_into()?;
    if program.fd().is_err() {
        program.load()?;
    }
    program
        .attach(Some(symbol), 0, path, None)
        .with_context(|| format!("Failed to attach {} to {}", program_name, symbol))?;
    Ok(())
}

struct InstrumentedLib {
    refs: u32,
    closers: Vec<Box<dyn Closer>>,
}

/// Reference-counted registry of instrumented libraries, keyed by a 64-bit
/// identity of the loaded object. The last unref releases the library's
/// probes exactly once.
#[derive(Default)]
pub struct TracerRegistry {
    libs: Mutex<HashMap<u64, InstrumentedLib>>,
}

impl TracerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn already_instrumented_lib(&self, id: u64) -> bool {
        self.libs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    /// Register probes attached for a library. Registering an id again
    /// merges the closers without bumping the reference count.
    pub fn record_instrumented_lib(&self, id: u64, closers: Vec<Box<dyn Closer>>) {
        let mut libs = self.libs.lock().unwrap_or_else(|e| e.into_inner());
        match libs.get_mut(&id) {
            Some(lib) => lib.closers.extend(closers),
            None => {
                libs.insert(id, InstrumentedLib { refs: 1, closers });
            }
        }
    }

    /// Another process mapped the same library.
    pub fn add_instrumented_lib_ref(&self, id: u64) {
        if let Some(lib) = self
            .libs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&id)
        {
            lib.refs += 1;
        }
    }

    /// Drop one reference. When the last holder goes away the library's
    /// closers run (LIFO) and the entry disappears.
    pub fn unlink_instrumented_lib(&self, id: u64) {
        let lib = {
            let mut libs = self.libs.lock().unwrap_or_else(|e| e.into_inner());
            let Some(lib) = libs.get_mut(&id) else { return };
            lib.refs = lib.refs.saturating_sub(1);
            if lib.refs > 0 {
                return;
            }
            libs.remove(&id)
        };
        if let Some(mut lib) = lib {
            while let Some(mut closer) = lib.closers.pop() {
                if let Err(e) = closer.close() {
                    warn!("failed to release probe for lib {:#x}: {}", id, e);
                }
            }
        }
    }

    pub fn instrumented_count(&self) -> usize {
        self.libs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Identity of a loaded object: a 64-bit hash over the backing device and
/// inode, stable for as long as the file exists.
pub fn lib_id_for(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    meta.dev().hash(&mut hasher);
    meta.ino().hash(&mut hasher);
    Ok(hasher.finish())
}

/// Shared objects worth instrumenting with uprobes.
pub static TLS_LIB_PATTERN: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"^libssl\.so(\.\d+)*$").unwrap());

/// Resolve a path from a process's mount namespace to the host filesystem.
/// Containerized processes expose their root under `/proc/<pid>/root`.
pub fn resolve_host_path(pid: i32, mapped: &Path) -> std::path::PathBuf {
    if mapped.starts_with("/proc") {
        return mapped.to_path_buf();
    }
    let mut host = std::path::PathBuf::from(format!("/proc/{}/root", pid));
    host.push(mapped.strip_prefix("/").unwrap_or(mapped));
    host
}

/// Shared objects mapped by the given PIDs whose file name matches the
/// pattern. Much cheaper than a full host scan.
pub fn find_libraries_for_pids(
    pids: &[u32],
    pattern: &regex::Regex,
) -> Result<std::collections::HashSet<std::path::PathBuf>> {
    let mut paths = std::collections::HashSet::new();

    for &pid in pids {
        let process = match procfs::process::Process::new(pid as i32) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let maps = match process.maps() {
            Ok(m) => m,
            Err(_) => continue,
        };

        for map in maps {
            if let procfs::process::MMapPath::Path(path_buf) = map.pathname
                && let Some(file_name) = path_buf.file_name().and_then(|n| n.to_str())
                && pattern.is_match(file_name)
            {
                let host_path = resolve_host_path(process.pid, &path_buf);
                if host_path.exists() {
                    paths.insert(host_path);
                }
            }
        }
    }

    Ok(paths)
}
