//! HTTP/1.1 record parsing. The probe pre-parses the status code and ships
//! the first request bytes verbatim; method, path and host come out of that
//! prefix with httparse.

use anyhow::{Result, anyhow};
use spantap_common::{HTTP_FLAG_CLIENT, HttpInfo};

use crate::ebpf::{EbpfConfig, ParseContext, Record, ServiceFilter, read_record_as};
use crate::span::{RequestSpan, SpanKind, apply_conn_tuple};

/// Parser entry for the HTTP tracer ring.
pub fn parse_http_info(
    _ctx: &mut ParseContext,
    _cfg: &EbpfConfig,
    record: &Record,
    _filter: &dyn ServiceFilter,
) -> Result<Option<RequestSpan>> {
    let event: HttpInfo =
        read_record_as(&record.raw_sample).ok_or_else(|| anyhow!("undersized HTTP record"))?;

    let mut span = RequestSpan {
        start_ns: event.start_ns,
        end_ns: event.end_ns,
        kind: if event.flags & HTTP_FLAG_CLIENT != 0 {
            SpanKind::HttpClient
        } else {
            SpanKind::HttpServer
        },
        status: event.status as i32,
        trace_ctx: (&event.tp).into(),
        pid: event.pid,
        ..Default::default()
    };
    apply_conn_tuple(&mut span, &event.conn);

    let prefix = trim_at_nul(&event.buf);
    if let Some((method, path)) = parse_request_line(prefix) {
        span.method = method;
        span.path = path;
    }

    Ok(Some(span))
}

fn trim_at_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(end) => &buf[..end],
        None => buf,
    }
}

/// Extract method and path from a possibly truncated request prefix. A
/// partial parse is fine as long as the request line itself was complete.
pub fn parse_request_line(buf: &[u8]) -> Option<(String, String)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(_) => match (req.method, req.path) {
            (Some(method), Some(path)) => Some((method.to_string(), path.to_string())),
            _ => None,
        },
        Err(_) => None,
    }
}
