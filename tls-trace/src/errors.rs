//! Unified error types for tls-trace
//!
//! Per-event failures (`MalformedEvent`) stay local to the event that caused
//! them. Lifecycle and I/O failures are aggregated and handed back from
//! `EventProcessor::close`, which may be called more than once and must
//! return the same outcome, so every variant is `Clone`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TlsTraceError {
    #[error("malformed event from pid {pid} fd {fd}: {reason}")]
    MalformedEvent {
        pid: u32,
        fd: u32,
        reason: MalformedReason,
    },

    #[error("event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("event processor is already serving")]
    AlreadyServing,

    #[error("event processor is closed")]
    Closed,

    #[error("I/O failure while {context}: {source}")]
    SinkIo {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("capture file encoding failed: {message}")]
    CaptureFormat { message: String },

    #[error("shutdown did not drain within {timeout:?}")]
    DrainTimeout { timeout: Duration },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

impl TlsTraceError {
    pub fn sink_io(context: impl Into<String>, source: io::Error) -> Self {
        TlsTraceError::SinkIo {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, TlsTraceError::MalformedEvent { .. })
    }
}

/// Why an event was rejected before touching any connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    PayloadTooLong { declared: u32, capacity: usize },
    UnsupportedSchema { version: u32 },
    UnknownKind { raw: u32 },
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedReason::PayloadTooLong { declared, capacity } => {
                write!(f, "payload length {} exceeds capacity {}", declared, capacity)
            }
            MalformedReason::UnsupportedSchema { version } => {
                write!(f, "unsupported schema version {}", version)
            }
            MalformedReason::UnknownKind { raw } => write!(f, "unknown event kind {}", raw),
        }
    }
}

pub type Result<T> = std::result::Result<T, TlsTraceError>;
