use std::{path::Path, process};

use clap::{Parser, Subcommand};

mod serve;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Tidestream - TTL-bound event stream server", long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the stream server
    Serve(serve::ServeCommand),
}

#[tokio::main]
async fn main() {
    // Values from .env must be visible before clap reads `env = ...`
    load_env_file(Path::new(".env"));

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = handle_command(opts).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Load environment variables from a .env file
fn load_env_file(path: &Path) {
    match dotenvy::from_path(path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", path.display());
        }
        Err(e) if e.not_found() => {
            // .env file not found is fine, just continue silently
        }
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                path.display(),
                e
            );
        }
    }
}

async fn handle_command(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Serve(cmd) => cmd.execute().await,
    }
}
