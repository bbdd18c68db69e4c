//! Wire-protocol parsers over kernel records. Each parser is a pure
//! function from a record's raw sample to at most one span.

pub mod http1;
pub mod http2;
pub mod postgres;
pub mod tcp;

use anyhow::{Result, anyhow};
use spantap_common::{EVENT_HTTP_INFO, EVENT_TCP_INFO, EVENT_TCP_LARGE_BUFFER};

use crate::ebpf::large_buffer::append_tcp_large_buffer;
use crate::ebpf::{EbpfConfig, ParseContext, Record, ServiceFilter};
use crate::span::RequestSpan;

/// Dispatching parser for rings that multiplex several record types: the
/// first byte selects the concrete decoder.
pub fn parse_record(
    ctx: &mut ParseContext,
    cfg: &EbpfConfig,
    record: &Record,
    filter: &dyn ServiceFilter,
) -> Result<Option<RequestSpan>> {
    match record.event_type() {
        Some(EVENT_HTTP_INFO) => http1::parse_http_info(ctx, cfg, record, filter),
        Some(EVENT_TCP_INFO) => tcp::parse_tcp_info(ctx, cfg, record, filter),
        Some(EVENT_TCP_LARGE_BUFFER) => append_tcp_large_buffer(ctx, record),
        Some(other) => Err(anyhow!("unknown record type {}", other)),
        None => Err(anyhow!("empty record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::IdentityPidsFilter;

    #[test]
    fn test_unknown_discriminator_is_an_error() {
        let mut ctx = ParseContext::default();
        let out = parse_record(
            &mut ctx,
            &EbpfConfig::default(),
            &Record::new(vec![0xee, 0, 0, 0]),
            &IdentityPidsFilter,
        );
        assert!(out.is_err());

        let out = parse_record(
            &mut ctx,
            &EbpfConfig::default(),
            &Record::default(),
            &IdentityPidsFilter,
        );
        assert!(out.is_err());
    }
}
