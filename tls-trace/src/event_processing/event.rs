//! Connection identity and event classification
//!
//! The producer hands over `SslDataEvent` values it decoded from the ring
//! buffer. Nothing here trusts the declared layout until the schema version,
//! kind and length fields have been checked.

use crate::errors::{MalformedReason, TlsTraceError};
use tls_trace_common::{EventKind, SslDataEvent, EVENT_SCHEMA_VERSION, MAX_DATA_SIZE};

/// `(pid, fd)`; the fd is only meaningful inside its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub pid: u32,
    pub fd: u32,
}

impl ConnectionKey {
    pub fn new(pid: u32, fd: u32) -> Self {
        Self { pid, fd }
    }

    pub fn of(event: &SslDataEvent) -> Self {
        Self::new(event.pid, event.fd)
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} fd {}", self.pid, self.fd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Plaintext returned by SSL_read: peer to instrumented process.
    Read,
    /// Plaintext passed to SSL_write: instrumented process to peer.
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "READ",
            Direction::Write => "WRITE",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the tracker should do with a validated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Data(Direction),
    Open,
    Close,
    Control,
}

impl From<EventKind> for EventAction {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::DataRead => EventAction::Data(Direction::Read),
            EventKind::DataWrite => EventAction::Data(Direction::Write),
            EventKind::ConnectionOpen => EventAction::Open,
            EventKind::ConnectionClose => EventAction::Close,
            EventKind::Control => EventAction::Control,
        }
    }
}

/// Checks schema version, kind and declared length, in that order.
pub fn classify(event: &SslDataEvent) -> Result<EventAction, MalformedReason> {
    if event.schema_version != EVENT_SCHEMA_VERSION {
        return Err(MalformedReason::UnsupportedSchema {
            version: event.schema_version,
        });
    }

    let kind = event
        .kind()
        .ok_or(MalformedReason::UnknownKind { raw: event.kind })?;

    check_length(event)?;
    Ok(kind.into())
}

pub(crate) fn check_length(event: &SslDataEvent) -> Result<(), MalformedReason> {
    if event.data_len as usize > MAX_DATA_SIZE {
        return Err(MalformedReason::PayloadTooLong {
            declared: event.data_len,
            capacity: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

/// [`classify`] with the connection identity attached to the error.
pub fn validate_event(event: &SslDataEvent) -> crate::errors::Result<EventAction> {
    classify(event).map_err(|reason| TlsTraceError::MalformedEvent {
        pid: event.pid,
        fd: event.fd,
        reason,
    })
}
