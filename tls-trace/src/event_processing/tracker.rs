//! Connection Tracker
//!
//! Keyed registry of live connections. Owns creation, generation changes,
//! idle eviction and the final flush. It never talks to a sink directly:
//! every call returns the records and close notices it produced, and the
//! processor forwards them in order.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace};
use tls_trace_common::SslDataEvent;
use tokio::time::Instant;

use crate::configuration::Tracking;
use crate::errors::{Result, TlsTraceError};
use crate::event_processing::event::{validate_event, ConnectionKey, Direction, EventAction};
use crate::event_processing::reassembler::{ReassembledUnit, Reassembler};

/// Identity of one connection generation, shared by all its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    pub key: ConnectionKey,
    pub generation: u64,
    pub comm: String,
    pub tid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub meta: ConnectionMeta,
    pub unit: ReassembledUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Connection-close event.
    Explicit,
    /// A connection-open arrived for a key that was still tracked.
    Reopened,
    Idle,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Explicit => "closed",
            CloseReason::Reopened => "superseded by reopen",
            CloseReason::Idle => "idle timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub meta: ConnectionMeta,
    pub reason: CloseReason,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutput {
    Record(StreamRecord),
    Closed(ConnectionInfo),
}

#[derive(Debug)]
struct ConnectionState {
    meta: ConnectionMeta,
    reassembler: Reassembler,
    created_ns: u64,
    last_activity: Instant,
}

impl ConnectionState {
    /// Consumes the state: a key with no entry in the table is closed.
    fn finish(mut self, reason: CloseReason) -> Vec<TrackerOutput> {
        let mut outputs: Vec<TrackerOutput> = self
            .reassembler
            .flush()
            .into_iter()
            .map(|unit| {
                TrackerOutput::Record(StreamRecord {
                    meta: self.meta.clone(),
                    unit,
                })
            })
            .collect();

        debug!(
            "{} generation {} {}",
            self.meta.key,
            self.meta.generation,
            reason.as_str()
        );
        outputs.push(TrackerOutput::Closed(ConnectionInfo {
            bytes_read: self.reassembler.emitted_bytes(Direction::Read),
            bytes_written: self.reassembler.emitted_bytes(Direction::Write),
            last_timestamp_ns: self
                .reassembler
                .last_timestamp_ns()
                .unwrap_or(self.created_ns),
            meta: self.meta,
            reason,
        }));
        outputs
    }
}

pub struct ConnectionTracker {
    connections: HashMap<ConnectionKey, ConnectionState>,
    idle_timeout: Duration,
    continuation_limit: u32,
    next_generation: u64,
}

impl ConnectionTracker {
    pub fn new(tracking: &Tracking) -> Self {
        Self {
            connections: HashMap::new(),
            idle_timeout: tracking.idle_timeout,
            continuation_limit: tracking.continuation_limit,
            next_generation: 0,
        }
    }

    /// Route one event. Malformed events are rejected before any lookup so
    /// they can neither create nor alter connection state.
    pub fn dispatch(&mut self, event: &SslDataEvent, now: Instant) -> Result<Vec<TrackerOutput>> {
        let action = validate_event(event)?;
        let key = ConnectionKey::of(event);

        let outputs = match action {
            EventAction::Open => {
                let outputs = match self.connections.remove(&key) {
                    Some(stale) => stale.finish(CloseReason::Reopened),
                    None => Vec::new(),
                };
                let state = new_state(
                    &mut self.next_generation,
                    self.continuation_limit,
                    key,
                    event,
                    now,
                );
                self.connections.insert(key, state);
                outputs
            }
            EventAction::Close => match self.connections.remove(&key) {
                Some(state) => state.finish(CloseReason::Explicit),
                None => {
                    trace!("close for untracked {}", key);
                    Vec::new()
                }
            },
            EventAction::Data(direction) => {
                let next_generation = &mut self.next_generation;
                let continuation_limit = self.continuation_limit;
                let state = self.connections.entry(key).or_insert_with(|| {
                    new_state(next_generation, continuation_limit, key, event, now)
                });
                state.last_activity = now;

                let unit = state.reassembler.push(direction, event).map_err(|reason| {
                    TlsTraceError::MalformedEvent {
                        pid: key.pid,
                        fd: key.fd,
                        reason,
                    }
                })?;

                match unit {
                    Some(unit) => vec![TrackerOutput::Record(StreamRecord {
                        meta: state.meta.clone(),
                        unit,
                    })],
                    None => Vec::new(),
                }
            }
            EventAction::Control => {
                if let Some(state) = self.connections.get_mut(&key) {
                    state.last_activity = now;
                }
                Vec::new()
            }
        };

        Ok(outputs)
    }

    /// Close every connection with no activity for at least the idle timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<TrackerOutput> {
        let mut idle: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|(_, state)| {
                now.saturating_duration_since(state.last_activity) >= self.idle_timeout
            })
            .map(|(key, _)| *key)
            .collect();
        idle.sort();

        let mut outputs = Vec::new();
        for key in idle {
            if let Some(state) = self.connections.remove(&key) {
                debug!("evicting idle {}", key);
                outputs.extend(state.finish(CloseReason::Idle));
            }
        }
        outputs
    }

    /// Flush and close every tracked connection.
    pub fn flush_all(&mut self) -> Vec<TrackerOutput> {
        let mut states: Vec<ConnectionState> =
            self.connections.drain().map(|(_, state)| state).collect();
        states.sort_by_key(|state| state.meta.key);

        states
            .into_iter()
            .flat_map(|state| state.finish(CloseReason::Shutdown))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn generation_of(&self, key: &ConnectionKey) -> Option<u64> {
        self.connections.get(key).map(|state| state.meta.generation)
    }

    pub fn pending_len(&self, key: &ConnectionKey, direction: Direction) -> Option<usize> {
        self.connections
            .get(key)
            .map(|state| state.reassembler.pending_len(direction))
    }

    /// Number of connection generations created so far.
    pub fn connections_opened(&self) -> u64 {
        self.next_generation
    }
}

fn new_state(
    next_generation: &mut u64,
    continuation_limit: u32,
    key: ConnectionKey,
    event: &SslDataEvent,
    now: Instant,
) -> ConnectionState {
    let generation = *next_generation;
    *next_generation += 1;
    debug!(
        "tracking {} ({}) as generation {}",
        key,
        event.command_as_str(),
        generation
    );

    ConnectionState {
        meta: ConnectionMeta {
            key,
            generation,
            comm: event.command_as_str().to_string(),
            tid: event.tid,
        },
        reassembler: Reassembler::new(continuation_limit),
        created_ns: event.timestamp_ns,
        last_activity: now,
    }
}
