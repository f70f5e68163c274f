//! Tails a MongoDB replica set oplog and republishes mutations on Redis
//! pub/sub. See `README.md` for the wire format and `Config` for the
//! recognized options.

mod checkpoint;
mod config;
mod error;
mod health;
mod health_state;
mod metrics;
mod oplog;
mod pipeline;
mod publisher;
mod resume;
mod tailer;
mod transform;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "otr", about = "Tails a MongoDB oplog and republishes mutations on Redis")]
struct Args {
    /// Path to a TOML config file. `OTR__*` environment variables always
    /// take precedence over values in it.
    #[arg(long)]
    config: Option<String>,

    /// Log level: error, warn, info, debug, or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Collapses every startup failure (config, bad Mongo/Redis URL, signal
/// handler install) into one `anyhow::Error` so `main` has a single exit
/// path. Once the pipeline is actually running, `pipeline::run`'s typed
/// `error::Error` is the only thing that can still fail it.
fn bootstrap() -> anyhow::Result<()> {
    let args = Args::parse();
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
    );
    pretty_env_logger::init();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let stop_tx = std::sync::Mutex::new(Some(stop_tx));
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        // Dropping the sender (rather than sending on it) is what
        // actually unblocks the tailer: its stop channel has zero
        // capacity, so a bare `send` would just block forever waiting
        // for a receiver that only polls with `try_recv`.
        if let Some(tx) = stop_tx.lock().expect("signal handler mutex poisoned").take() {
            drop(tx);
        }
    })
    .context("failed to install signal handler")?;

    pipeline::run(&config, stop_rx).context("pipeline exited with an error")
}

fn main() {
    if let Err(err) = bootstrap() {
        error!("{err:#}");
        std::process::exit(1);
    }
}
