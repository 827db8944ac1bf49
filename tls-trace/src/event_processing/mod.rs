//! Event Processing Module
//!
//! Turns the interleaved stream of captured TLS plaintext events into ordered
//! per-connection records.
//!
//! Key components:
//! - EventProcessor: queue, consume loop and shutdown lifecycle
//! - ConnectionTracker: (pid, fd) registry with generations and idle eviction
//! - Reassembler: joins full-buffer continuations into logical units
//! - EventParser: decodes raw kernel records

pub mod event;
pub mod parser;
pub mod processor;
pub mod reassembler;
pub mod tracker;

pub use event::{classify, validate_event, ConnectionKey, Direction, EventAction};
pub use parser::EventParser;
pub use processor::{EventProcessor, ProcessorState};
pub use reassembler::{ReassembledUnit, Reassembler, UnitEnd};
pub use tracker::{
    CloseReason, ConnectionInfo, ConnectionMeta, ConnectionTracker,
    StreamRecord, TrackerOutput,
};
