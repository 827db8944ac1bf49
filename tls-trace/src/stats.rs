//! Processing counters
//!
//! Updated from the producer side (`write`) and the consume loop, read
//! through a serializable snapshot that is logged at shutdown.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    events_processed: AtomicU64,
    malformed_events: AtomicU64,
    records_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_evicted: AtomicU64,
    sink_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_queued: u64,
    pub events_dropped: u64,
    pub events_processed: u64,
    pub malformed_events: u64,
    pub records_emitted: u64,
    pub bytes_emitted: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_evicted: u64,
    pub sink_errors: u64,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self) {
        self.events_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, bytes: usize) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_emitted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn set_connections_opened(&self, total: u64) {
        self.connections_opened.store(total, Ordering::Relaxed);
    }

    pub fn record_closed(&self, evicted: bool) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.connections_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
