//! Tally CLI: aggregate queue events into per-type statistics.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use tally::{CliArgs, TallyConfig, init_tracing, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(args.log_level.as_deref());

    let config = match TallyConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        queue = %config.queue.name,
        dlq = %config.queue.dlq_name(),
        batch_size = config.processor.batch_size,
        "Starting tally"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Tally failed: {e}");
            ExitCode::FAILURE
        }
    }
}
