use std::process::ExitCode;

use clap::Parser;
use git_track::cli::Cli;
use git_track::logging::setup_logger;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = cli
        .verbosity
        .is_present()
        .then(|| cli.verbosity.tracing_level_filter());
    setup_logger(level);

    match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
