use std::path::PathBuf;

use clap::Parser;

pub mod configuration;
pub mod errors;
pub mod event_processing;
pub mod output_strategy;
pub mod replay;
pub mod stats;

pub use configuration::{Configuration, OutputMode, TranscriptFormat};
pub use errors::{Result, TlsTraceError};
pub use event_processing::{EventProcessor, ProcessorState};
pub use replay::InputFormat;
pub use stats::StatsSnapshot;

#[derive(Debug, Clone, Parser)]
#[clap(
    name = "tls-trace",
    about = "Rebuild TLS plaintext streams from captured SSL read/write events"
)]
pub struct Args {
    #[clap(short, long, help = "Recorded events to replay")]
    pub input: PathBuf,

    #[clap(long, value_enum, default_value = "json", help = "Layout of the input file")]
    pub input_format: InputFormat,

    #[clap(long, help = "Directory holding <Timestamp>.bin payload files")]
    pub payload_dir: Option<PathBuf>,

    #[clap(
        short,
        long,
        help = "Capture file, or transcript directory in transcript mode"
    )]
    pub output: Option<PathBuf>,

    #[clap(short, long, help = "Output mode: transcript or capture")]
    pub mode: Option<OutputMode>,

    #[clap(long, help = "Write transcript bodies as hex dumps")]
    pub hex: bool,

    #[clap(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.payload_dir.is_some() && self.input_format == InputFormat::Raw {
            return Err("--payload-dir only applies to json input".to_string());
        }
        if self.hex && self.mode == Some(OutputMode::Capture) {
            return Err("--hex only applies to transcript mode".to_string());
        }
        Ok(())
    }

    /// Config file first, then command-line overrides.
    pub fn to_configuration(&self) -> Result<Configuration> {
        let mut builder = Configuration::builder();
        if let Some(path) = &self.config {
            builder = builder.from_config_file(path)?;
        }
        if let Some(output) = &self.output {
            builder = builder.with_destination(output);
        }
        if let Some(mode) = self.mode {
            builder = builder.with_mode(mode);
        }
        if self.hex {
            builder = builder.with_transcript_format(TranscriptFormat::Hex);
        }
        builder.build()
    }
}
