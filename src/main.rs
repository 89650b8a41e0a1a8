mod cli;
mod engine;
mod installer;
mod model;
mod orchestrator;
mod resolver;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Logs go to `--log-file` when given, else to stderr outside the TUI.
/// The TUI owns the terminal, so without a log file it logs nothing.
fn init_tracing(args: &cli::Cli) -> Result<()> {
    let default = if args.debug {
        "installer2iso=debug"
    } else {
        "installer2iso=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else if !args.is_tui() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(&args)?;
    let is_non_tui = !args.is_tui();

    match cli::run(args).await {
        Ok(code) => {
            // Exit explicitly in non-TUI modes so a pending terminal prompt
            // cannot hold the runtime open.
            if is_non_tui || code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
