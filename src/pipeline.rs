//! Bootstrap and supervision: wires the resume oracle, the tailer, and
//! the partition workers together, and owns the shutdown sequence.
//! Grounded on the teacher's `pool.rs`, which runs the same shape of
//! "spawn several long-lived worker threads sharing a client handle,
//! then join them all on drop."

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use log::{error, info, warn};
use mongodb::sync::Client as MongoClient;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::Result;
use crate::health::{self, HealthThresholds};
use crate::health_state::HealthState;
use crate::publisher::{self, PartitionRouter};
use crate::resume;
use crate::tailer::Tailer;

/// Run the pipeline until `stop` fires, then shut down in bounded time.
///
/// `stop` firing means: the tailer exits its loop promptly, which drops
/// its `PartitionRouter` (and with it, every partition's sender half),
/// which makes every partition worker's next `recv()` return `Err`,
/// which drains them all without an explicit signal of their own.
pub fn run(config: &Config, stop: Receiver<()>) -> Result<()> {
    let mongo_client = MongoClient::with_uri_str(&config.mongo_url)?;
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = redis_client.get_connection()?;
    let checkpoint_key = config.checkpoint_key();

    let start = resume::start(
        &mut redis_conn,
        &mongo_client,
        &checkpoint_key,
        config.max_catch_up(),
    );

    let initial_checkpoint = match Checkpoint::read(&mut redis_conn, &checkpoint_key) {
        Ok(checkpoint) => checkpoint,
        Err(err) => {
            warn!("failed to read checkpoint for publisher dedup, starting without one: {err}");
            None
        }
    };

    let partitions = config.publisher_parallelism.max(1);
    let health = HealthState::new(partitions);

    {
        let addr = config.metrics_addr.clone();
        let health = Arc::clone(&health);
        let thresholds = HealthThresholds {
            tailer_stall: config.health_tailer_stall(),
            backoff_stall: config.health_backoff_stall(),
        };
        thread::spawn(move || {
            if let Err(err) = health::serve(&addr, health, thresholds) {
                error!("metrics server on {addr} exited: {err}");
            }
        });
    }

    let mut senders = Vec::with_capacity(partitions);
    let mut worker_handles = Vec::with_capacity(partitions);

    for partition in 0..partitions {
        let (tx, rx) = bounded(config.partition_channel_capacity);
        senders.push(tx);

        let redis_url = config.redis_url.clone();
        let checkpoint_key = checkpoint_key.clone();
        let max_retries = config.max_publish_retries;
        let backoff_cap = config.publish_backoff_cap();
        let initial = initial_checkpoint;
        let health = Arc::clone(&health);

        worker_handles.push(thread::spawn(move || {
            if let Err(err) = publisher::run_partition(
                partition,
                rx,
                &redis_url,
                &checkpoint_key,
                initial,
                max_retries,
                backoff_cap,
                health,
            ) {
                error!("partition {partition} worker exited with an error: {err}");
            }
        }));
    }

    let router = PartitionRouter::new(senders);
    let tailer = Tailer::new(
        mongo_client,
        config.mongo_query_timeout(),
        config.redis_prefix.clone(),
        config.namespace_filter(),
        Arc::clone(&health),
    );

    info!("tailing from {start}");
    tailer.tail(start, &router, &stop);
    drop(router);
    drop(tailer);

    for handle in worker_handles {
        let _ = handle.join();
    }

    info!("pipeline shut down cleanly");
    Ok(())
}

/// Upper bound on how long a graceful shutdown should be allowed to
/// take: the longest a single stalled mongo query can block, plus the
/// longest a publish retry loop can back off for, per spec.md §5.
pub fn shutdown_budget(config: &Config) -> Duration {
    config.mongo_query_timeout() + config.publish_backoff_cap() * config.max_publish_retries
}
