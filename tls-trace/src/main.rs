use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tls_trace::replay::{load_events, replay};
use tls_trace::{Args, EventProcessor};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    env_logger::init();

    let config = args.to_configuration()?;
    let events = load_events(&args.input, args.input_format, args.payload_dir.as_deref())?;
    info!(
        "Replaying {} events from {} into {} ({})",
        events.len(),
        args.input.display(),
        config.output.destination.display(),
        config.output.mode
    );

    let processor = Arc::new(EventProcessor::new(config));

    tokio::select! {
        result = replay(processor.clone(), events) => {
            let stats = result?;
            println!(
                "Processed {} events: {} records ({} bytes), {} connections, {} malformed, {} dropped",
                stats.events_processed,
                stats.records_emitted,
                stats.bytes_emitted,
                stats.connections_opened,
                stats.malformed_events,
                stats.events_dropped
            );
        }
        _ = signal::ctrl_c() => {
            warn!("Interrupted, flushing output...");
            processor.close().await?;
        }
    }

    info!("Exiting...");
    Ok(())
}
