//! Per-connection stream reassembly
//!
//! A capture that fills the whole event buffer is presumed to continue in
//! the next event for the same connection and direction. Fragments are held
//! back until a short capture arrives, the continuation limit is reached, or
//! the connection is flushed.

use bytes::{Bytes, BytesMut};
use log::warn;
use tls_trace_common::{SslDataEvent, MAX_DATA_SIZE};

use crate::errors::MalformedReason;
use crate::event_processing::event::{check_length, Direction};

/// Why a unit was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEnd {
    /// The last fragment was shorter than the capture buffer.
    Complete,
    /// Too many consecutive full fragments; the message may continue.
    ContinuationLimit,
    /// Pending bytes forced out by close, eviction or shutdown.
    Flushed,
}

impl UnitEnd {
    pub fn is_complete(&self) -> bool {
        matches!(self, UnitEnd::Complete)
    }
}

/// A run of bytes ready for a sink, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledUnit {
    pub direction: Direction,
    pub first_timestamp_ns: u64,
    pub last_timestamp_ns: u64,
    /// Stream offset of the first byte in this direction.
    pub offset: u64,
    pub fragments: u32,
    pub end: UnitEnd,
    pub data: Bytes,
}

impl ReassembledUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct DirectionCursor {
    last_timestamp_ns: Option<u64>,
    emitted_bytes: u64,
    pending: BytesMut,
    pending_fragments: u32,
    pending_first_timestamp_ns: u64,
}

impl DirectionCursor {
    fn take(&mut self, direction: Direction, end: UnitEnd) -> ReassembledUnit {
        let data = self.pending.split().freeze();
        let unit = ReassembledUnit {
            direction,
            first_timestamp_ns: self.pending_first_timestamp_ns,
            last_timestamp_ns: self.last_timestamp_ns.unwrap_or(self.pending_first_timestamp_ns),
            offset: self.emitted_bytes,
            fragments: self.pending_fragments,
            end,
            data,
        };
        self.emitted_bytes += unit.data.len() as u64;
        self.pending_fragments = 0;
        unit
    }
}

#[derive(Debug)]
pub struct Reassembler {
    continuation_limit: u32,
    cursors: [DirectionCursor; 2],
}

impl Reassembler {
    pub fn new(continuation_limit: u32) -> Self {
        Self {
            continuation_limit: continuation_limit.max(1),
            cursors: Default::default(),
        }
    }

    /// Feed one fragment. A malformed length leaves all state untouched.
    pub fn push(
        &mut self,
        direction: Direction,
        event: &SslDataEvent,
    ) -> Result<Option<ReassembledUnit>, MalformedReason> {
        check_length(event)?;

        let limit = self.continuation_limit;
        let cursor = &mut self.cursors[direction.index()];

        if let Some(last) = cursor.last_timestamp_ns {
            if event.timestamp_ns < last {
                warn!(
                    "pid {} fd {} {}: timestamp went backwards ({} < {}), keeping write order",
                    event.pid, event.fd, direction, event.timestamp_ns, last
                );
            }
        }
        cursor.last_timestamp_ns = Some(event.timestamp_ns);

        let payload = event.payload();
        if payload.is_empty() {
            return Ok(None);
        }

        if cursor.pending.is_empty() {
            cursor.pending_first_timestamp_ns = event.timestamp_ns;
        }
        cursor.pending.extend_from_slice(payload);
        cursor.pending_fragments += 1;

        if payload.len() < MAX_DATA_SIZE {
            return Ok(Some(cursor.take(direction, UnitEnd::Complete)));
        }

        if cursor.pending_fragments >= limit {
            warn!(
                "pid {} fd {} {}: {} consecutive full captures, emitting {} bytes as truncated",
                event.pid,
                event.fd,
                direction,
                cursor.pending_fragments,
                cursor.pending.len()
            );
            return Ok(Some(cursor.take(direction, UnitEnd::ContinuationLimit)));
        }

        Ok(None)
    }

    /// Emit whatever is pending in either direction, read side first.
    pub fn flush(&mut self) -> Vec<ReassembledUnit> {
        [Direction::Read, Direction::Write]
            .into_iter()
            .filter_map(|direction| {
                let cursor = &mut self.cursors[direction.index()];
                if cursor.pending.is_empty() {
                    None
                } else {
                    Some(cursor.take(direction, UnitEnd::Flushed))
                }
            })
            .collect()
    }

    pub fn emitted_bytes(&self, direction: Direction) -> u64 {
        self.cursors[direction.index()].emitted_bytes
    }

    pub fn pending_len(&self, direction: Direction) -> usize {
        self.cursors[direction.index()].pending.len()
    }

    pub fn last_timestamp_ns(&self) -> Option<u64> {
        self.cursors
            .iter()
            .filter_map(|cursor| cursor.last_timestamp_ns)
            .max()
    }
}
