//! Fallback parser for connections no dedicated tracer claimed. Inspects
//! the payload prefixes (or the reassembled large buffers, when the kernel
//! had to split them) and upgrades the span to SQL or HTTP/2/gRPC when the
//! bytes allow it.

use anyhow::{Result, anyhow};
use bytes::Bytes;
use spantap_common::{
    PACKET_TYPE_REQUEST, PACKET_TYPE_RESPONSE, TCP_BUF_SIZE, TCP_RESP_BUF_SIZE, TcpInfo,
};

use super::{http2, postgres};
use crate::ebpf::large_buffer::extract_tcp_large_buffer;
use crate::ebpf::{EbpfConfig, ParseContext, Record, ServiceFilter, read_record_as};
use crate::span::{RequestSpan, SpanKind, apply_conn_tuple};

/// `TcpInfo::direction` value for connections this process initiated.
pub const DIRECTION_CLIENT: u8 = 1;

/// Parser entry for the generic TCP tracer ring.
pub fn parse_tcp_info(
    ctx: &mut ParseContext,
    _cfg: &EbpfConfig,
    record: &Record,
    _filter: &dyn ServiceFilter,
) -> Result<Option<RequestSpan>> {
    let event: TcpInfo =
        read_record_as(&record.raw_sample).ok_or_else(|| anyhow!("undersized TCP record"))?;

    let mut request = Bytes::copy_from_slice(&event.buf[..(event.req_len as usize).min(TCP_BUF_SIZE)]);
    let mut response =
        Bytes::copy_from_slice(&event.rbuf[..(event.resp_len as usize).min(TCP_RESP_BUF_SIZE)]);

    // A large buffer, when present, carries the complete payload the inline
    // prefix only hints at.
    if event.tp.trace_id != [0; 16] {
        if let Some(full) = extract_tcp_large_buffer(
            ctx,
            event.tp.trace_id,
            event.tp.span_id,
            PACKET_TYPE_REQUEST,
        ) {
            request = full;
        }
        if let Some(full) = extract_tcp_large_buffer(
            ctx,
            event.tp.trace_id,
            event.tp.span_id,
            PACKET_TYPE_RESPONSE,
        ) {
            response = full;
        }
    }

    let is_client = event.direction == DIRECTION_CLIENT;
    let mut span = RequestSpan {
        start_ns: event.start_ns,
        end_ns: event.end_ns,
        kind: SpanKind::Tcp,
        trace_ctx: (&event.tp).into(),
        pid: event.pid,
        request_len: event.req_len as u64,
        response_len: event.resp_len as u64,
        ..Default::default()
    };
    apply_conn_tuple(&mut span, &event.conn);

    classify(&mut span, &request, &response, is_client);
    Ok(Some(span))
}

fn classify(span: &mut RequestSpan, request: &[u8], response: &[u8], is_client: bool) {
    if let Some(operation) = postgres::sql_operation(request) {
        span.kind = SpanKind::SqlClient;
        span.method = operation.to_string();
        span.sql_error = postgres::parse_postgres_error(response);
        if span.sql_error.is_some() {
            span.status = 1;
        }
        return;
    }

    if http2::looks_like_http2(request) {
        let req = http2::scan_frames(request);
        let resp = http2::scan_frames(response);
        let grpc = req.is_grpc() || resp.is_grpc() || resp.grpc_status.is_some();
        span.kind = match (grpc, is_client) {
            (true, true) => SpanKind::GrpcClient,
            (true, false) => SpanKind::GrpcServer,
            (false, true) => SpanKind::HttpClient,
            (false, false) => SpanKind::HttpServer,
        };
        if let Some(method) = req.method {
            span.method = method;
        }
        if let Some(path) = req.path {
            span.path = path;
        }
        span.status = match (resp.grpc_status, resp.status) {
            (Some(grpc_status), _) if grpc => grpc_status,
            (_, Some(status)) => status,
            _ => 0,
        };
    }
}
