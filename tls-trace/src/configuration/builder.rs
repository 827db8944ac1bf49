//! Configuration Builder
//!
//! Provides a builder pattern for constructing Configuration instances
//! from multiple sources with proper validation.

use super::{ConfigFile, Configuration, Io, Output, Pipeline, Runtime, Tracking};
use super::{OutputMode, OverflowPolicy, TranscriptFormat};
use crate::errors::TlsTraceError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builder for creating Configuration instances
///
/// Supports fluent API and multiple sources:
/// - Explicit setters (used by the replay binary's CLI)
/// - Configuration files (YAML, JSON or TOML)
/// - Defaults
#[derive(Debug)]
pub struct ConfigurationBuilder {
    output: Output,
    pipeline: Pipeline,
    tracking: Tracking,
    io: Io,
    runtime: Runtime,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            output: Output::default(),
            pipeline: Pipeline::default(),
            tracking: Tracking::default(),
            io: Io::default(),
            runtime: Runtime::default(),
        }
    }

    pub fn with_destination<P: Into<PathBuf>>(mut self, destination: P) -> Self {
        self.output.destination = destination.into();
        self
    }

    pub fn with_mode(mut self, mode: OutputMode) -> Self {
        self.output.mode = mode;
        self
    }

    pub fn with_transcript_format(mut self, format: TranscriptFormat) -> Self {
        self.output.transcript_format = format;
        self
    }

    pub fn with_max_segment_size(mut self, size: usize) -> Self {
        self.output.max_segment_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.pipeline.queue_capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.pipeline.overflow = policy;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline.write_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline.close_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tracking.idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.tracking.sweep_interval = interval;
        self
    }

    pub fn with_continuation_limit(mut self, limit: u32) -> Self {
        self.tracking.continuation_limit = limit;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.io.retry_limit = limit;
        self
    }

    /// Configure from a YAML, JSON or TOML configuration file
    pub fn from_config_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsTraceError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| TlsTraceError::ConfigError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        // Auto-detect format by extension or content
        let extension = path.extension().and_then(|s| s.to_str());
        let mut builder = match extension {
            Some("json") => self.from_json_str(&content)?,
            Some("toml") => self.from_toml_str(&content)?,
            _ if content.trim_start().starts_with('{') => self.from_json_str(&content)?,
            _ => self.from_yaml_str(&content)?,
        };

        builder.runtime.config_file = Some(path.to_path_buf());
        Ok(builder)
    }

    /// Configure from YAML string
    pub fn from_yaml_str(self, yaml: &str) -> Result<Self, TlsTraceError> {
        let file: ConfigFile =
            serde_yaml::from_str(yaml).map_err(|e| TlsTraceError::ConfigError {
                message: format!("Failed to parse YAML config: {}", e),
            })?;
        Ok(self.merge(file))
    }

    /// Configure from JSON string
    pub fn from_json_str(self, json: &str) -> Result<Self, TlsTraceError> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| TlsTraceError::ConfigError {
                message: format!("Failed to parse JSON config: {}", e),
            })?;
        Ok(self.merge(file))
    }

    /// Configure from TOML string
    pub fn from_toml_str(self, toml_str: &str) -> Result<Self, TlsTraceError> {
        let file: ConfigFile =
            toml::from_str(toml_str).map_err(|e| TlsTraceError::ConfigError {
                message: format!("Failed to parse TOML config: {}", e),
            })?;
        Ok(self.merge(file))
    }

    fn merge(mut self, file: ConfigFile) -> Self {
        let output = file.output;
        if let Some(destination) = output.destination {
            self.output.destination = destination;
        }
        if let Some(mode) = output.mode {
            self.output.mode = mode;
        }
        if let Some(format) = output.transcript_format {
            self.output.transcript_format = format;
        }
        if let Some(size) = output.max_segment_size {
            self.output.max_segment_size = size;
        }

        let pipeline = file.pipeline;
        if let Some(capacity) = pipeline.queue_capacity {
            self.pipeline.queue_capacity = capacity;
        }
        if let Some(overflow) = pipeline.overflow {
            self.pipeline.overflow = overflow;
        }
        if let Some(ms) = pipeline.write_timeout_ms {
            self.pipeline.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = pipeline.close_timeout_ms {
            self.pipeline.close_timeout = Duration::from_millis(ms);
        }

        let tracking = file.tracking;
        if let Some(ms) = tracking.idle_timeout_ms {
            self.tracking.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = tracking.sweep_interval_ms {
            self.tracking.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = tracking.continuation_limit {
            self.tracking.continuation_limit = limit;
        }

        if let Some(limit) = file.io.retry_limit {
            self.io.retry_limit = limit;
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<Configuration, TlsTraceError> {
        let config = Configuration {
            output: self.output,
            pipeline: self.pipeline,
            tracking: self.tracking,
            io: self.io,
            runtime: self.runtime,
        };

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
