//! Start one grain from the command line and hold it until stdin closes.

use std::{
    path::PathBuf,
    sync::{Arc, mpsc},
};

use clap::Parser;
use tracing::{error, info};

use grainbox::{
    CapRef, Config, Spawner,
    error::fatal,
    host::{TeardownObserver, TeardownStage},
    logging,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; built-in host paths are used without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Package the grain belongs to
    package_id: String,

    /// Grain to start
    grain_id: String,
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => fatal("cannot load configuration", &e),
    };

    let (closed_tx, closed) = mpsc::channel();
    let observer: TeardownObserver = Arc::new(move |stage: TeardownStage| {
        info!(?stage, "teardown");
        if stage == TeardownStage::Closed {
            let _ = closed_tx.send(());
        }
    });
    let spawner = Spawner::new(config.host).with_observer(observer);

    let spawned = match spawner.spawn(&args.package_id, &args.grain_id, CapRef::null()) {
        Ok(spawned) => spawned,
        Err(e) => fatal("spawn failed", &e),
    };
    info!(grain_id = %args.grain_id, "grain running; close stdin to stop it");

    if let Err(e) = std::io::copy(&mut std::io::stdin(), &mut std::io::sink()) {
        error!(error = %e, "reading stdin failed; stopping grain");
    }

    spawned.bootstrap.release();
    spawned.handle.release();
    let _ = closed.recv();
    info!("grain stopped");
}
