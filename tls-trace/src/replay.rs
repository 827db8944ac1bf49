//! Recorded event replay
//!
//! Feeds events captured earlier through an `EventProcessor`. Two input
//! layouts are supported: JSON lines with one payload file per event, and a
//! raw concatenation of kernel records.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tls_trace_common::{SslDataEvent, EVENT_SCHEMA_VERSION};

use crate::errors::TlsTraceError;
use crate::event_processing::{EventParser, EventProcessor};
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InputFormat {
    /// One JSON object per line, payload in `<payload-dir>/<Timestamp>.bin`.
    #[default]
    Json,
    /// Back-to-back raw `SslDataEvent` records.
    Raw,
}

/// Process name as recorded: either a byte array or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordedComm {
    Bytes(Vec<u8>),
    Text(String),
}

impl Default for RecordedComm {
    fn default() -> Self {
        RecordedComm::Text(String::new())
    }
}

impl RecordedComm {
    fn as_bytes(&self) -> &[u8] {
        match self {
            RecordedComm::Bytes(bytes) => bytes,
            RecordedComm::Text(text) => text.as_bytes(),
        }
    }
}

/// One line of a JSON recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordedEvent {
    pub data_type: i64,
    pub timestamp: u64,
    pub pid: u32,
    pub tid: u32,
    pub data_len: i32,
    #[serde(default)]
    pub comm: RecordedComm,
    pub fd: u32,
    /// TLS protocol version seen at capture time; informational only.
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub schema_version: Option<u32>,
}

impl RecordedEvent {
    pub fn payload_path(&self, payload_dir: &Path) -> PathBuf {
        payload_dir.join(format!("{}.bin", self.timestamp))
    }

    /// Build the kernel-layout event. Out-of-range kinds and lengths are kept
    /// as recorded so the processor rejects them like live input.
    pub fn to_event(&self, payload: &[u8]) -> SslDataEvent {
        let raw_kind = u32::try_from(self.data_type).unwrap_or(u32::MAX);
        let data_len = u32::try_from(self.data_len).unwrap_or(0);

        let mut event = SslDataEvent::new()
            .with_timestamp(self.timestamp)
            .with_pid(self.pid)
            .with_tid(self.tid)
            .with_fd(self.fd)
            .with_schema_version(self.schema_version.unwrap_or(EVENT_SCHEMA_VERSION))
            .with_command(self.comm.as_bytes())
            .with_payload(payload)
            .with_data_len(data_len);
        event.kind = raw_kind;
        event
    }
}

pub fn parse_recorded_line(line: &str) -> Result<RecordedEvent> {
    Ok(serde_json::from_str(line)?)
}

/// Load a JSON-lines recording. Without a payload directory every event
/// carries an empty payload.
pub fn load_json_events(input: &Path, payload_dir: Option<&Path>) -> Result<Vec<SslDataEvent>> {
    let content = fs::read_to_string(input)
        .with_context(|| format!("failed to read recording {}", input.display()))?;

    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let recorded = parse_recorded_line(line)
            .with_context(|| format!("{}:{}: invalid event", input.display(), index + 1))?;
        if let Some(version) = recorded.version {
            trace!("event {} recorded with TLS version {:#x}", recorded.timestamp, version);
        }

        let payload = match payload_dir {
            Some(dir) => {
                let path = recorded.payload_path(dir);
                fs::read(&path)
                    .with_context(|| format!("failed to read payload {}", path.display()))?
            }
            None => Vec::new(),
        };
        events.push(recorded.to_event(&payload));
    }

    debug!("loaded {} recorded events from {}", events.len(), input.display());
    Ok(events)
}

pub fn load_raw_events(input: &Path) -> Result<Vec<SslDataEvent>> {
    let buffer = fs::read(input)
        .with_context(|| format!("failed to read raw events {}", input.display()))?;
    EventParser::parse_stream(&buffer)
        .with_context(|| format!("failed to decode raw events {}", input.display()))
}

pub fn load_events(
    input: &Path,
    format: InputFormat,
    payload_dir: Option<&Path>,
) -> Result<Vec<SslDataEvent>> {
    match format {
        InputFormat::Json => load_json_events(input, payload_dir),
        InputFormat::Raw => load_raw_events(input),
    }
}

/// Serve, write every event in order, then close. Events refused with
/// `QueueFull` are retried so a replay never loses input.
pub async fn replay(processor: Arc<EventProcessor>, events: Vec<SslDataEvent>) -> Result<StatsSnapshot> {
    let serving = processor.clone();
    let serve_handle = tokio::spawn(async move { serving.serve().await });

    let total = events.len();
    for event in events {
        loop {
            match processor.write(event).await {
                Ok(()) => break,
                Err(TlsTraceError::QueueFull { capacity }) => {
                    warn!("queue full (capacity {}), retrying", capacity);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    info!("replayed {} events", total);

    let closed = processor.close().await;
    match serve_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(TlsTraceError::Closed)) => debug!("close drained the queue before serve started"),
        Ok(Err(e)) => debug!("serve finished with: {}", e),
        Err(e) => warn!("serve task failed: {}", e),
    }
    closed.context("event processor reported an error on close")?;

    Ok(processor.stats())
}
