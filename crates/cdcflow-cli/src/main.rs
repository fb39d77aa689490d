mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cdcflow",
    version,
    about = "Change data capture from an embedded engine into per-table streams"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one bounded capture and print its summary
    Capture {
        /// Path to capture YAML file
        capture: PathBuf,
    },
    /// Stream changes to stdout until interrupted
    Stream {
        /// Path to capture YAML file
        capture: PathBuf,
        /// Records buffered between the engine and stdout
        #[arg(long, default_value_t = 256)]
        buffer: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Capture { capture } => commands::capture::execute(&capture).await,
        Commands::Stream { capture, buffer } => commands::stream::execute(&capture, buffer).await,
    }
}
