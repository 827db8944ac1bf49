//! Unified Configuration System
//!
//! Combines defaults, configuration files and explicit overrides into a
//! single validated object that is handed to [`crate::EventProcessor`].
//!
//! # Basic Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tls_trace::configuration::{Configuration, OutputMode};
//!
//! let config = Configuration::builder()
//!     .with_destination("/tmp/session.pcap")
//!     .with_mode(OutputMode::Capture)
//!     .with_idle_timeout(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//!
//! assert!(config.is_capture_mode());
//! assert_eq!(config.tracking.continuation_limit, 16);
//! ```

pub mod builder;
pub mod types;
pub mod validation;

pub use builder::ConfigurationBuilder;
pub use types::*;

use crate::errors::TlsTraceError;

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub output: Output,
    pub pipeline: Pipeline,
    pub tracking: Tracking,
    pub io: Io,
    pub runtime: Runtime,
}

impl Configuration {
    /// Create a new builder for configuration
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), TlsTraceError> {
        self.validate_output()?;
        self.validate_pipeline()?;
        self.validate_tracking()?;
        Ok(())
    }

    pub fn is_capture_mode(&self) -> bool {
        self.output.mode == OutputMode::Capture
    }

    pub fn drops_on_overflow(&self) -> bool {
        self.pipeline.overflow == OverflowPolicy::Drop
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            output: Output::default(),
            pipeline: Pipeline::default(),
            tracking: Tracking::default(),
            io: Io::default(),
            runtime: Runtime::default(),
        }
    }
}
