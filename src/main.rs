//! shroud server binary.

use clap::Parser;
use shroud::config::{Config, DEFAULT_CONFIG};
use shroud::{Server, logging, signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shroud")]
#[command(about = "Non-blocking TLS request server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{DEFAULT_CONFIG}");
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a path or use --print-config");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let server = match Server::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = signal::install_signal_handler(server.shutdown_handle()) {
        tracing::error!(error = %e, "failed to install signal handler");
        std::process::exit(1);
    }

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
