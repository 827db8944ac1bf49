//! Configuration type definitions
//!
//! Defines the core configuration structures used throughout the system,
//! plus the on-disk representation loaded by the builder.

use crate::errors::TlsTraceError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Plain per-connection text files.
    Transcript,
    /// One pcap file with synthesized TCP/IP framing.
    Capture,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Transcript => "transcript",
            OutputMode::Capture => "capture",
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OutputMode {
    type Err = TlsTraceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transcript" | "text" => Ok(OutputMode::Transcript),
            "capture" | "pcap" => Ok(OutputMode::Capture),
            _ => Err(TlsTraceError::ConfigError {
                message: format!(
                    "Invalid output mode: {}. Valid modes: transcript, capture",
                    s
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptFormat {
    #[default]
    Text,
    Hex,
}

/// What `write` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Block the producer up to `write_timeout`, then fail with `QueueFull`.
    #[default]
    Backpressure,
    /// Discard the event and count it.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub destination: PathBuf,
    pub mode: OutputMode,
    pub transcript_format: TranscriptFormat,
    pub max_segment_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub write_timeout: Duration,
    pub close_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracking {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// At most this many fragments join one unit; the fragment that reaches
    /// the limit closes the unit even when it was a full capture.
    pub continuation_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Io {
    pub retry_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Runtime {
    pub config_file: Option<PathBuf>,
}

/// Largest TCP payload that still fits an IPv4 total length field.
pub const MAX_SEGMENT_SIZE_LIMIT: usize = 65_535 - 20 - 20;

impl Default for Output {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("tls-trace.pcap"),
            mode: OutputMode::Capture,
            transcript_format: TranscriptFormat::Text,
            max_segment_size: 1460,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::Backpressure,
            write_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            continuation_limit: 16,
        }
    }
}

impl Default for Io {
    fn default() -> Self {
        Self { retry_limit: 3 }
    }
}

/// On-disk configuration. Every field is optional; absent fields keep the
/// value already held by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub output: OutputFile,
    pub pipeline: PipelineFile,
    pub tracking: TrackingFile,
    pub io: IoFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutputFile {
    pub destination: Option<PathBuf>,
    pub mode: Option<OutputMode>,
    pub transcript_format: Option<TranscriptFormat>,
    pub max_segment_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineFile {
    pub queue_capacity: Option<usize>,
    pub overflow: Option<OverflowPolicy>,
    pub write_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingFile {
    pub idle_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub continuation_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct IoFile {
    pub retry_limit: Option<u32>,
}
