//! Terminal data products of the ingestion pipeline.

use std::fmt;
use std::net::IpAddr;

use spantap_common::{ConnTuple, TraceParent};

/// Identity triple aggregating PIDs into one logical service for export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServiceUID {
    pub name: String,
    pub namespace: String,
    pub instance: String,
}

impl ServiceUID {
    pub fn name_namespace(&self) -> ServiceNameNamespace {
        ServiceNameNamespace {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Lookup key for server-side service resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServiceNameNamespace {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    HttpClient,
    HttpServer,
    GrpcClient,
    GrpcServer,
    SqlClient,
    Tcp,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanKind::HttpClient => "HTTP_CLIENT",
            SpanKind::HttpServer => "HTTP_SERVER",
            SpanKind::GrpcClient => "GRPC_CLIENT",
            SpanKind::GrpcServer => "GRPC_SERVER",
            SpanKind::SqlClient => "SQL_CLIENT",
            SpanKind::Tcp => "TCP",
        };
        f.write_str(s)
    }
}

/// Position of a span in a distributed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: [u8; 8],
    pub flags: u8,
}

impl TraceContext {
    pub fn is_valid(&self) -> bool {
        self.trace_id != [0; 16] && self.span_id != [0; 8]
    }
}

impl From<&TraceParent> for TraceContext {
    fn from(tp: &TraceParent) -> Self {
        TraceContext {
            trace_id: tp.trace_id,
            span_id: tp.span_id,
            parent_span_id: tp.parent_span_id,
            flags: tp.flags,
        }
    }
}

/// SQLSTATE and message extracted from a database error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub sql_state: String,
    pub message: String,
}

/// One reconstructed application request, ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpan {
    /// Monotonic nanoseconds as reported by the kernel.
    pub start_ns: u64,
    pub end_ns: u64,
    pub kind: SpanKind,
    pub method: String,
    pub path: String,
    pub peer: Option<IpAddr>,
    pub host: Option<IpAddr>,
    pub peer_port: u16,
    pub host_port: u16,
    pub status: i32,
    pub trace_ctx: TraceContext,
    pub sql_error: Option<SqlError>,
    pub service: ServiceUID,
    pub pid: u32,
    /// Request/response payload sizes where the probe reported them.
    pub request_len: u64,
    pub response_len: u64,
}

impl Default for RequestSpan {
    fn default() -> Self {
        RequestSpan {
            start_ns: 0,
            end_ns: 0,
            kind: SpanKind::Tcp,
            method: String::new(),
            path: String::new(),
            peer: None,
            host: None,
            peer_port: 0,
            host_port: 0,
            status: 0,
            trace_ctx: TraceContext::default(),
            sql_error: None,
            service: ServiceUID::default(),
            pid: 0,
            request_len: 0,
            response_len: 0,
        }
    }
}

/// Decode a probe-reported address, collapsing IPv4-in-IPv6 mappings.
pub fn decode_addr(raw: &[u8; 16]) -> Option<IpAddr> {
    if raw == &[0u8; 16] {
        return None;
    }
    let v6 = std::net::Ipv6Addr::from(*raw);
    match v6.to_ipv4_mapped() {
        Some(v4) => Some(IpAddr::V4(v4)),
        None => Some(IpAddr::V6(v6)),
    }
}

/// Populate peer/host fields of a span from the kernel connection tuple.
/// The probe reports the tuple from the instrumented socket's point of view:
/// source is the local (host) side, destination is the remote peer.
pub fn apply_conn_tuple(span: &mut RequestSpan, conn: &ConnTuple) {
    span.host = decode_addr(&conn.s_addr);
    span.peer = decode_addr(&conn.d_addr);
    span.host_port = conn.s_port;
    span.peer_port = conn.d_port;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addr_v4_mapped() {
        let mut raw = [0u8; 16];
        raw[10] = 0xff;
        raw[11] = 0xff;
        raw[12] = 10;
        raw[13] = 0;
        raw[14] = 0;
        raw[15] = 7;
        assert_eq!(decode_addr(&raw), Some("10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_decode_addr_zero_is_none() {
        assert_eq!(decode_addr(&[0u8; 16]), None);
    }

    #[test]
    fn test_trace_context_validity() {
        let mut ctx = TraceContext::default();
        assert!(!ctx.is_valid());
        ctx.trace_id[0] = 1;
        ctx.span_id[0] = 1;
        assert!(ctx.is_valid());
    }
}
