//! Reassembly of payloads the kernel had to split across multiple
//! ring-buffer records.
//!
//! Each logical message is keyed by `(trace_id, span_id, packet_type)`. A
//! NEW action starts (or restarts) the slot, APPEND extends it, and
//! extraction consumes it. The table is bounded three ways: per-entry byte
//! budget, LRU-evicted entry count, and a TTL checked on every access.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use serde::Deserialize;
use spantap_common::{LARGE_BUFFER_ACTION_APPEND, LARGE_BUFFER_ACTION_NEW, TcpLargeBufferHeader};

use super::{ParseContext, Record, read_record_as};
use crate::span::RequestSpan;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LargeBufferConfig {
    /// Byte budget per entry; appends past it are truncated.
    pub max_bytes: usize,
    /// Table capacity; the least-recently-used entry is evicted beyond it.
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for LargeBufferConfig {
    fn default() -> Self {
        LargeBufferConfig {
            max_bytes: 1 << 20,
            max_entries: 1024,
            ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LargeBufferKey {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub packet_type: u8,
}

struct Slot {
    data: BytesMut,
    touched: Instant,
}

pub struct LargeBufferTable {
    slots: LruCache<LargeBufferKey, Slot>,
    max_bytes: usize,
    ttl: Duration,
}

impl LargeBufferTable {
    pub fn new(cfg: LargeBufferConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        LargeBufferTable {
            slots: LruCache::new(capacity),
            max_bytes: cfg.max_bytes,
            ttl: Duration::from_secs(cfg.ttl_secs),
        }
    }

    /// Start a fresh slot, discarding any previous content under the key.
    /// The kernel signals a new logical message; no merge happens.
    pub fn insert_new(&mut self, key: LargeBufferKey, payload: &[u8]) {
        self.evict_expired();
        let mut data = BytesMut::from(payload);
        data.truncate(self.max_bytes);
        self.slots.put(
            key,
            Slot {
                data,
                touched: Instant::now(),
            },
        );
    }

    /// Extend an existing slot. Appends without a head fragment are dropped:
    /// the NEW record was lost and the payload cannot be reconstructed.
    pub fn append(&mut self, key: LargeBufferKey, payload: &[u8]) {
        self.evict_expired();
        if let Some(slot) = self.slots.get_mut(&key) {
            let room = self.max_bytes.saturating_sub(slot.data.len());
            slot.data.extend_from_slice(&payload[..payload.len().min(room)]);
            slot.touched = Instant::now();
        }
    }

    /// Return the slot's content and remove it. A second extraction without
    /// an intervening NEW misses.
    pub fn extract(&mut self, key: &LargeBufferKey) -> Option<Bytes> {
        self.evict_expired();
        self.slots.pop(key).map(|slot| slot.data.freeze())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn evict_expired(&mut self) {
        loop {
            let expired = self
                .slots
                .peek_lru()
                .is_some_and(|(_, slot)| slot.touched.elapsed() >= self.ttl);
            if !expired {
                break;
            }
            self.slots.pop_lru();
        }
    }
}

/// Parser half of the reassembly: file the record's fragment into the table.
/// Never emits a span; the reassembled payload is picked up later by the
/// protocol parser that knows the trace context.
pub fn append_tcp_large_buffer(ctx: &mut ParseContext, record: &Record) -> Result<Option<RequestSpan>> {
    let header: TcpLargeBufferHeader = read_record_as(&record.raw_sample)
        .ok_or_else(|| anyhow!("large-buffer record shorter than header"))?;

    let key = LargeBufferKey {
        trace_id: header.trace_id,
        span_id: header.span_id,
        packet_type: header.packet_type,
    };
    let body = &record.raw_sample[TcpLargeBufferHeader::SIZE..];
    let payload = &body[..body.len().min(header.len as usize)];

    match header.action {
        LARGE_BUFFER_ACTION_NEW => ctx.large_buffers.insert_new(key, payload),
        LARGE_BUFFER_ACTION_APPEND => ctx.large_buffers.append(key, payload),
        other => return Err(anyhow!("unknown large-buffer action {}", other)),
    }
    Ok(None)
}

/// Consume the reassembled payload for a trace position, if any.
pub fn extract_tcp_large_buffer(
    ctx: &mut ParseContext,
    trace_id: [u8; 16],
    span_id: [u8; 8],
    packet_type: u8,
) -> Option<Bytes> {
    ctx.large_buffers.extract(&LargeBufferKey {
        trace_id,
        span_id,
        packet_type,
    })
}
