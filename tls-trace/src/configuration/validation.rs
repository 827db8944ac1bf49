//! Configuration validation logic

use super::{Configuration, MAX_SEGMENT_SIZE_LIMIT};
use crate::errors::TlsTraceError;

impl Configuration {
    pub fn validate_output(&self) -> Result<(), TlsTraceError> {
        if self.output.destination.as_os_str().is_empty() {
            return Err(TlsTraceError::ConfigError {
                message: "Output destination must not be empty".to_string(),
            });
        }
        if self.output.max_segment_size == 0
            || self.output.max_segment_size > MAX_SEGMENT_SIZE_LIMIT
        {
            return Err(TlsTraceError::ConfigError {
                message: format!(
                    "max_segment_size must be between 1 and {}",
                    MAX_SEGMENT_SIZE_LIMIT
                ),
            });
        }
        Ok(())
    }

    pub fn validate_pipeline(&self) -> Result<(), TlsTraceError> {
        if self.pipeline.queue_capacity == 0 {
            return Err(TlsTraceError::ConfigError {
                message: "queue_capacity must be greater than zero".to_string(),
            });
        }
        if self.pipeline.close_timeout.is_zero() {
            return Err(TlsTraceError::ConfigError {
                message: "close_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_tracking(&self) -> Result<(), TlsTraceError> {
        if self.tracking.idle_timeout.is_zero() {
            return Err(TlsTraceError::ConfigError {
                message: "idle_timeout must be greater than zero".to_string(),
            });
        }
        if self.tracking.sweep_interval.is_zero() {
            return Err(TlsTraceError::ConfigError {
                message: "sweep_interval must be greater than zero".to_string(),
            });
        }
        if self.tracking.continuation_limit == 0 {
            return Err(TlsTraceError::ConfigError {
                message: "continuation_limit must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
