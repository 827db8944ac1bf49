//! Safe Event Parsing
//!
//! Decodes raw kernel records into [`SslDataEvent`] with bounds checking.
//! Field contents are not trusted here; `classify` checks them afterwards.

use anyhow::anyhow;
use log::warn;
use tls_trace_common::SslDataEvent;

/// Size of one raw record as written by the capture hooks.
pub const RAW_EVENT_SIZE: usize = std::mem::size_of::<SslDataEvent>();

pub struct EventParser;

impl EventParser {
    /// Parse one record from the start of `buffer`.
    pub fn parse(buffer: &[u8]) -> anyhow::Result<SslDataEvent> {
        Self::check_buffer_size(buffer, RAW_EVENT_SIZE)?;

        // SAFETY: the buffer holds at least RAW_EVENT_SIZE bytes, the struct
        // is repr(C) plain data, and every bit pattern is a valid value.
        let event = unsafe { buffer.as_ptr().cast::<SslDataEvent>().read_unaligned() };
        Ok(event)
    }

    /// Parse a concatenation of fixed-size records. A trailing partial
    /// record is reported and skipped.
    pub fn parse_stream(buffer: &[u8]) -> anyhow::Result<Vec<SslDataEvent>> {
        if buffer.is_empty() {
            return Err(anyhow!("Empty buffer provided for event parsing"));
        }

        let mut chunks = buffer.chunks_exact(RAW_EVENT_SIZE);
        let events = chunks
            .by_ref()
            .map(Self::parse)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let remainder = chunks.remainder().len();
        if remainder > 0 {
            warn!(
                "Ignoring {} trailing bytes that do not form a complete event",
                remainder
            );
        }
        Ok(events)
    }

    /// Check buffer size with descriptive error messages
    fn check_buffer_size(buffer: &[u8], required_size: usize) -> anyhow::Result<()> {
        if buffer.is_empty() {
            return Err(anyhow!("Empty buffer provided for event parsing"));
        }

        if buffer.len() < required_size {
            return Err(anyhow!(
                "Buffer size {} is smaller than required size {}",
                buffer.len(),
                required_size
            ));
        }

        Ok(())
    }
}

/// Serialize an event into its raw record form.
pub fn encode_raw(event: &SslDataEvent) -> Vec<u8> {
    // SAFETY: SslDataEvent is repr(C) with no padding (size is a multiple of
    // its 8-byte alignment and fields are laid out without gaps).
    let bytes = unsafe {
        std::slice::from_raw_parts((event as *const SslDataEvent).cast::<u8>(), RAW_EVENT_SIZE)
    };
    bytes.to_vec()
}
