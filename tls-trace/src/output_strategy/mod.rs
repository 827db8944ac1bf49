//! Output strategies
//!
//! A sink receives reassembled records in processing order and owns the
//! single append point of its destination. Two strategies exist:
//! per-connection text transcripts and a synthesized pcap capture.

pub mod capture;
pub mod frame;
pub mod transcript;

pub use capture::CaptureSink;
pub use transcript::TranscriptSink;

use std::io::{self, Write};

use log::warn;

use crate::configuration::{Configuration, OutputMode};
use crate::errors::{Result, TlsTraceError};
use crate::event_processing::{ConnectionInfo, StreamRecord};

pub trait Sink: Send {
    /// Append one reassembled record.
    fn emit(&mut self, record: &StreamRecord) -> Result<()>;

    /// The connection generation will produce no more records.
    fn connection_closed(&mut self, info: &ConnectionInfo) -> Result<()>;

    /// Flush and release the destination. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Build the sink selected by `config.output.mode`. Destinations are opened
/// lazily on first use.
pub fn create_sink(config: &Configuration) -> Box<dyn Sink> {
    let output = &config.output;
    match output.mode {
        OutputMode::Transcript => Box::new(TranscriptSink::new(
            output.destination.clone(),
            output.transcript_format,
            config.io.retry_limit,
        )),
        OutputMode::Capture => Box::new(CaptureSink::new(
            output.destination.clone(),
            output.max_segment_size,
            config.io.retry_limit,
        )),
    }
}

pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Retries transient failures of each individual write below a buffer. A
/// failed `write` call accepted no bytes, so retrying it never duplicates
/// output the way retrying a whole `write_all` could.
pub(crate) struct RetryingWriter<W> {
    inner: W,
    retry_limit: u32,
}

impl<W: Write> RetryingWriter<W> {
    pub(crate) fn new(inner: W, retry_limit: u32) -> Self {
        Self { inner, retry_limit }
    }

    fn retry<T>(&mut self, mut op: impl FnMut(&mut W) -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match op(&mut self.inner) {
                Err(e) if is_transient(&e) && attempt < self.retry_limit => {
                    attempt += 1;
                    warn!("transient write failure (attempt {}/{}): {}", attempt, self.retry_limit, e);
                }
                result => return result,
            }
        }
    }
}

impl<W: Write> Write for RetryingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.retry(|inner| inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.retry(|inner| inner.flush())
    }
}

/// Run `op`, retrying transient failures up to `retry_limit` extra times.
pub(crate) fn retry_io<T>(
    retry_limit: u32,
    context: &str,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < retry_limit => {
                attempt += 1;
                warn!(
                    "transient failure while {} (attempt {}/{}): {}",
                    context, attempt, retry_limit, e
                );
            }
            Err(e) => return Err(TlsTraceError::sink_io(context, e)),
        }
    }
}
