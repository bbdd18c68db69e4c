//! Kernel event ingestion: ring-buffer records, per-tracer parsers and the
//! shared parse context.

pub mod forwarder;
pub mod large_buffer;
pub mod registry;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Deserialize;

use crate::export::pid_tracker::PidServiceTracker;
use crate::span::{RequestSpan, ServiceUID};

/// One raw sample handed over by the kernel.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub raw_sample: Vec<u8>,
}

impl Record {
    pub fn new(raw_sample: Vec<u8>) -> Self {
        Record { raw_sample }
    }

    /// Event-type discriminator: the first byte of every record.
    pub fn event_type(&self) -> Option<u8> {
        self.raw_sample.first().copied()
    }
}

/// Reinterpret the front of a raw sample as a kernel struct. Returns `None`
/// when the sample is shorter than the struct.
pub fn read_record_as<T: Copy>(raw: &[u8]) -> Option<T> {
    if raw.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { (raw.as_ptr() as *const T).read_unaligned() })
}

/// Ring-buffer tuning knobs, as recognized under the `ebpf` config section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EbpfConfig {
    /// Pinned object file holding the probe set. Kernel-side ingestion is
    /// disabled when unset.
    pub bytecode_path: Option<String>,
    /// Selects the debug-instrumented probe set (`<bytecode_path>.debug`).
    pub bpf_debug: bool,
    pub wakeup_len: u32,
    pub batch_length: u32,
}

impl EbpfConfig {
    pub fn resolved_bytecode_path(&self) -> Option<String> {
        let path = self.bytecode_path.as_ref()?;
        Some(if self.bpf_debug {
            format!("{}.debug", path)
        } else {
            path.clone()
        })
    }
}

impl Default for EbpfConfig {
    fn default() -> Self {
        EbpfConfig {
            bytecode_path: None,
            bpf_debug: false,
            wakeup_len: 8,
            batch_length: 100,
        }
    }
}

/// State a parser may keep across records of one forwarder. Private to that
/// forwarder's task; never shared.
pub struct ParseContext {
    pub large_buffers: large_buffer::LargeBufferTable,
}

impl ParseContext {
    pub fn new(cfg: large_buffer::LargeBufferConfig) -> Self {
        ParseContext {
            large_buffers: large_buffer::LargeBufferTable::new(cfg),
        }
    }
}

impl Default for ParseContext {
    fn default() -> Self {
        ParseContext::new(large_buffer::LargeBufferConfig::default())
    }
}

/// Per-tracer parse function: decodes one record into at most one span.
/// Errors mean a malformed record; the forwarder drops it and counts.
pub type SpanParser =
    fn(&mut ParseContext, &EbpfConfig, &Record, &dyn ServiceFilter) -> Result<Option<RequestSpan>>;

/// Decides whether spans of a PID leave the forwarder, and under which
/// service identity.
pub trait ServiceFilter: Send + Sync {
    fn service_for_pid(&self, pid: u32) -> Option<ServiceUID>;
}

/// Passes every PID through with an empty service identity. Used by tracers
/// that do their own attribution downstream.
pub struct IdentityPidsFilter;

impl ServiceFilter for IdentityPidsFilter {
    fn service_for_pid(&self, _pid: u32) -> Option<ServiceUID> {
        Some(ServiceUID::default())
    }
}

/// Filters against the shared PID service tracker: spans of PIDs that are
/// not bound to a discovered service are dropped.
pub struct TrackedPidsFilter {
    tracker: Arc<Mutex<PidServiceTracker>>,
}

impl TrackedPidsFilter {
    pub fn new(tracker: Arc<Mutex<PidServiceTracker>>) -> Self {
        TrackedPidsFilter { tracker }
    }
}

impl ServiceFilter for TrackedPidsFilter {
    fn service_for_pid(&self, pid: u32) -> Option<ServiceUID> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .service_for(pid as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_record_as_too_short() {
        #[repr(C)]
        #[derive(Clone, Copy)]
        struct Fixed {
            a: u32,
            b: u64,
        }
        assert!(read_record_as::<Fixed>(&[0u8; 4]).is_none());
        let raw = [0u8; 16];
        assert!(read_record_as::<Fixed>(&raw).is_some());
    }

    #[test]
    fn test_record_event_type() {
        assert_eq!(Record::new(vec![12, 0, 0]).event_type(), Some(12));
        assert_eq!(Record::default().event_type(), None);
    }

    #[test]
    fn test_bpf_debug_selects_debug_probe_set() {
        let mut cfg = EbpfConfig {
            bytecode_path: Some("/usr/lib/spantap/probes.o".into()),
            ..Default::default()
        };
        assert_eq!(
            cfg.resolved_bytecode_path().as_deref(),
            Some("/usr/lib/spantap/probes.o")
        );
        cfg.bpf_debug = true;
        assert_eq!(
            cfg.resolved_bytecode_path().as_deref(),
            Some("/usr/lib/spantap/probes.o.debug")
        );
        cfg.bytecode_path = None;
        assert_eq!(cfg.resolved_bytecode_path(), None);
    }
}
