#![no_std]

//! Record layouts shared between the kernel probes and the user-space agent.
//!
//! Every ring-buffer record starts with a one-byte event-type discriminator.
//! Multi-byte integers are little-endian (native on the supported targets).
//! Field order is chosen so the structs carry no implicit padding holes.

/// First byte of every ring-buffer record.
pub const EVENT_HTTP_INFO: u8 = 1;
pub const EVENT_TCP_INFO: u8 = 2;
pub const EVENT_TCP_LARGE_BUFFER: u8 = 12;

/// `TcpLargeBufferHeader::packet_type` values.
pub const PACKET_TYPE_REQUEST: u8 = 1;
pub const PACKET_TYPE_RESPONSE: u8 = 2;

/// `TcpLargeBufferHeader::action` values.
pub const LARGE_BUFFER_ACTION_NEW: u8 = 0;
pub const LARGE_BUFFER_ACTION_APPEND: u8 = 1;

/// `HttpInfo::flags` bit: set when the probe observed the client side of the
/// connection, clear for the server side.
pub const HTTP_FLAG_CLIENT: u8 = 0x1;

/// Payload prefix captured for HTTP events.
pub const HTTP_BUF_SIZE: usize = 160;
/// Request payload prefix captured for generic TCP events.
pub const TCP_BUF_SIZE: usize = 256;
/// Response payload prefix captured for generic TCP events.
pub const TCP_RESP_BUF_SIZE: usize = 128;

/// W3C-style position in a distributed trace, as written by the probes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: [u8; 8],
    pub flags: u8,
    pub _pad: [u8; 3],
}

impl TraceParent {
    pub const ZERO: TraceParent = TraceParent {
        trace_id: [0; 16],
        span_id: [0; 8],
        parent_span_id: [0; 8],
        flags: 0,
        _pad: [0; 3],
    };
}

/// Source/destination tuple of the instrumented socket. Addresses are
/// IPv4-in-IPv6 mapped when the connection is IPv4.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnTuple {
    pub s_addr: [u8; 16],
    pub d_addr: [u8; 16],
    pub s_port: u16,
    pub d_port: u16,
}

impl ConnTuple {
    pub const ZERO: ConnTuple = ConnTuple {
        s_addr: [0; 16],
        d_addr: [0; 16],
        s_port: 0,
        d_port: 0,
    };
}

/// One completed HTTP request/response pair, status code pre-parsed by the
/// probe, first `HTTP_BUF_SIZE` request bytes carried verbatim.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HttpInfo {
    pub event_type: u8,
    pub flags: u8,
    pub _pad: u16,
    pub pid: u32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub conn: ConnTuple,
    pub status: u16,
    pub _pad2: u16,
    pub tp: TraceParent,
    pub buf: [u8; HTTP_BUF_SIZE],
    pub _pad3: u32,
}

/// One request/response exchange on a connection no higher-level parser
/// claimed. Payload prefixes carried for user-space protocol detection.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TcpInfo {
    pub event_type: u8,
    pub direction: u8,
    pub _pad: u16,
    pub pid: u32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub conn: ConnTuple,
    pub req_len: u32,
    pub resp_len: u32,
    pub tp: TraceParent,
    pub buf: [u8; TCP_BUF_SIZE],
    pub rbuf: [u8; TCP_RESP_BUF_SIZE],
}

/// Fixed-size header preceding each fragment of a payload that exceeded the
/// ring-record capacity. Exactly `len` payload bytes follow the header,
/// truncated to the ring record bound.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpLargeBufferHeader {
    pub event_type: u8,
    pub packet_type: u8,
    pub _pad: u16,
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub len: u32,
    pub action: u8,
    pub _pad2: [u8; 3],
}

impl TcpLargeBufferHeader {
    pub const SIZE: usize = core::mem::size_of::<TcpLargeBufferHeader>();
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceParent {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConnTuple {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for HttpInfo {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TcpInfo {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TcpLargeBufferHeader {}
