//! Drains one kernel ring buffer, runs the tracer's parser on each record
//! and publishes the resulting spans.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::Result;
use aya::maps::{MapData, RingBuf};
use log::{debug, warn};

use super::{EbpfConfig, ParseContext, Record, ServiceFilter, SpanParser};
use crate::pipe::Queue;
use crate::span::RequestSpan;

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Where records come from. Abstracted so the forwarder loop can be driven
/// without a live kernel map.
pub trait RecordSource: Send {
    /// `Ok(None)` means nothing is available right now.
    fn next_record(&mut self) -> Result<Option<Record>>;
}

pub struct RingBufSource {
    ring: RingBuf<MapData>,
}

impl RingBufSource {
    pub fn new(ring: RingBuf<MapData>) -> Self {
        RingBufSource { ring }
    }
}

impl RecordSource for RingBufSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.ring.next().map(|item| Record::new(item.to_vec())))
    }
}

/// Resource released when the forwarder exits (probe links, loaded
/// collections). Failures are logged, never propagated.
pub trait Closer: Send {
    fn close(&mut self) -> Result<()>;
}

impl<F: FnMut() -> Result<()> + Send> Closer for F {
    fn close(&mut self) -> Result<()> {
        self()
    }
}

pub struct RingBufForwarder<S: RecordSource> {
    name: &'static str,
    cfg: EbpfConfig,
    source: S,
    ctx: ParseContext,
    parser: SpanParser,
    filter: Arc<dyn ServiceFilter>,
    closers: Vec<Box<dyn Closer>>,
    shutdown: Arc<AtomicBool>,
    parse_errors: u64,
}

impl<S: RecordSource> RingBufForwarder<S> {
    pub fn new(
        name: &'static str,
        cfg: EbpfConfig,
        source: S,
        ctx: ParseContext,
        parser: SpanParser,
        filter: Arc<dyn ServiceFilter>,
        closers: Vec<Box<dyn Closer>>,
    ) -> Self {
        Self::with_shutdown(
            name,
            cfg,
            source,
            ctx,
            parser,
            filter,
            closers,
            crate::pipe::shutdown_flag(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_shutdown(
        name: &'static str,
        cfg: EbpfConfig,
        source: S,
        ctx: ParseContext,
        parser: SpanParser,
        filter: Arc<dyn ServiceFilter>,
        closers: Vec<Box<dyn Closer>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        RingBufForwarder {
            name,
            cfg,
            source,
            ctx,
            parser,
            filter,
            closers,
            shutdown,
            parse_errors: 0,
        }
    }

    /// Drain the ring until shutdown. Each record is parsed, filtered by the
    /// PID service filter and published exactly once; parse failures drop
    /// the record and bump the error counter. No batching beyond what the
    /// ring reader provides.
    pub async fn run(mut self, output: Queue<RequestSpan>) {
        let mut backoff = POLL_INTERVAL;
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.source.next_record() {
                Ok(Some(record)) => {
                    backoff = POLL_INTERVAL;
                    self.handle_record(&record, &output).await;
                }
                Ok(None) => {
                    backoff = POLL_INTERVAL;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!("{}: ring buffer read failed: {}. Will retry.", self.name, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        // Drain whatever the ring still holds before releasing resources.
        while let Ok(Some(record)) = self.source.next_record() {
            self.handle_record(&record, &output).await;
        }
        self.close_all();
    }

    async fn handle_record(&mut self, record: &Record, output: &Queue<RequestSpan>) {
        let span = match (self.parser)(&mut self.ctx, &self.cfg, record, self.filter.as_ref()) {
            Ok(Some(span)) => span,
            Ok(None) => return,
            Err(e) => {
                self.parse_errors += 1;
                debug!("{}: dropping malformed record: {}", self.name, e);
                return;
            }
        };
        let Some(service) = self.filter.service_for_pid(span.pid) else {
            return;
        };
        let mut span = span;
        span.service = service;
        output.send(span).await;
    }

    /// Registered closers run in LIFO order; a failing closer does not
    /// abort the rest of the shutdown.
    fn close_all(&mut self) {
        while let Some(mut closer) = self.closers.pop() {
            if let Err(e) = closer.close() {
                warn!("{}: closer failed during shutdown: {}", self.name, e);
            }
        }
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::IdentityPidsFilter;
    use crate::span::{ServiceUID, SpanKind};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubSource {
        records: VecDeque<Result<Option<Record>>>,
    }

    impl RecordSource for StubSource {
        fn next_record(&mut self) -> Result<Option<Record>> {
            self.records.pop_front().unwrap_or(Ok(None))
        }
    }

    /// Parser: 4-byte LE pid, or an error on anything shorter.
    fn pid_parser(
        _ctx: &mut ParseContext,
        _cfg: &EbpfConfig,
        record: &Record,
        _filter: &dyn ServiceFilter,
    ) -> Result<Option<RequestSpan>> {
        let raw = &record.raw_sample;
        if raw.len() < 4 {
            return Err(anyhow!("short record"));
        }
        let pid = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if pid == 0 {
            return Ok(None);
        }
        Ok(Some(RequestSpan {
            pid,
            kind: SpanKind::Tcp,
            ..Default::default()
        }))
    }

    struct DenyOddPids;
    impl ServiceFilter for DenyOddPids {
        fn service_for_pid(&self, pid: u32) -> Option<ServiceUID> {
            (pid % 2 == 0).then(ServiceUID::default)
        }
    }

    fn record_for_pid(pid: u32) -> Result<Option<Record>> {
        Ok(Some(Record::new(pid.to_le_bytes().to_vec())))
    }

    #[tokio::test]
    async fn test_parse_filter_and_publish() {
        let source = StubSource {
            records: VecDeque::from([
                record_for_pid(2),
                Err(anyhow!("transient read failure")),
                record_for_pid(3),             // filtered: odd pid
                Ok(Some(Record::new(vec![1]))), // parse error
                record_for_pid(0),             // parser drop
                record_for_pid(4),
            ]),
        };

        let closed: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (c1, c2) = (Arc::clone(&closed), Arc::clone(&closed));
        let closers: Vec<Box<dyn Closer>> = vec![
            Box::new(move || {
                c1.lock().unwrap().push("first");
                Ok(())
            }),
            Box::new(move || {
                c2.lock().unwrap().push("second");
                Err(anyhow!("already detached"))
            }),
        ];

        let shutdown = Arc::new(AtomicBool::new(false));
        let forwarder = RingBufForwarder::with_shutdown(
            "test",
            EbpfConfig::default(),
            source,
            ParseContext::default(),
            pid_parser,
            Arc::new(DenyOddPids),
            closers,
            Arc::clone(&shutdown),
        );

        let output: Queue<RequestSpan> = Queue::new(16);
        let mut spans = output.subscribe();

        let handle = tokio::spawn(forwarder.run(output));
        let first = spans.recv().await.unwrap();
        assert_eq!(first.pid, 2);
        let second = spans.recv().await.unwrap();
        assert_eq!(second.pid, 4);

        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        // Closers ran in LIFO order; the failure did not stop the first.
        assert_eq!(*closed.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_identity_filter_passes_all() {
        let mut ctx = ParseContext::default();
        let record = Record::new(7u32.to_le_bytes().to_vec());
        let span = pid_parser(&mut ctx, &EbpfConfig::default(), &record, &IdentityPidsFilter)
            .unwrap()
            .unwrap();
        assert!(IdentityPidsFilter.service_for_pid(span.pid).is_some());
    }
}
