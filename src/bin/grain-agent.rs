//! The first program run inside a grain's sandbox.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use grainbox::{Config, agent::Agent, error::fatal, logging};

/// Read the grain's manifest, then run and supervise its app.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; built-in sandbox paths are used without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbose);
    info!("grain-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => fatal("cannot load configuration", &e),
    };

    match Agent::new(config.agent).run() {
        Ok(status) => std::process::exit(status),
        Err(e) => fatal("grain agent failed", &e),
    }
}
