//! C4 — the Redis Publisher.
//!
//! Publications are routed by `hash(docID) mod N` to one of `N`
//! single-writer partitions, so that all mutations of one document are
//! delivered to Redis in oplog order even though partitions run on their
//! own threads. Each partition worker is a tiny state machine per
//! spec.md §4.4: idle, waiting on its channel; publishing, issuing
//! `PUBLISH` to every channel of the current publication; checkpointing,
//! persisting `(timestamp, txIdx)` via a CAS that never regresses; and
//! backoff, after a publish or checkpoint attempt fails, before the next
//! retry.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bson::{doc, Bson};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::health_state::HealthState;
use crate::oplog::{OplogTimestamp, Publication};

/// Routes publications to their partition's channel by `hash(docID) mod
/// N`. Cloning is cheap: it's just a `Vec` of channel handles.
#[derive(Clone)]
pub struct PartitionRouter {
    senders: Vec<Sender<Publication>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("all partition workers have disconnected")]
    Disconnected,
}

impl PartitionRouter {
    pub fn new(senders: Vec<Sender<Publication>>) -> Self {
        assert!(!senders.is_empty(), "at least one partition is required");
        PartitionRouter { senders }
    }

    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }

    /// Route one publication to its partition, blocking if that
    /// partition's bounded channel is full (the tailer's natural
    /// backpressure signal). Returns `Err(RouteError::Disconnected)` only
    /// once every worker has exited, meaning the pipeline is shutting
    /// down.
    pub fn route(&self, publication: Publication) -> std::result::Result<(), RouteError> {
        let partition = partition_for(&publication.doc_id, self.senders.len());
        self.senders[partition]
            .send(publication)
            .map_err(|_| RouteError::Disconnected)
    }
}

/// Hashes a document identity to a partition index. BSON's own encoding
/// is used as the hashed bytes rather than any particular scalar
/// representation, so identities of different BSON types that happen to
/// stringify the same way don't collide.
fn partition_for(doc_id: &Bson, partitions: usize) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let bytes = bson::to_vec(&doc! {"id": doc_id.clone()}).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    hasher.write(&bytes);
    (hasher.finish() as usize) % partitions.max(1)
}

/// The state a partition worker is in, tracked only for logging; the
/// control flow below is the actual state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Publishing,
    Checkpointing,
    Backoff,
}

/// Backoff schedule: doubling from 100ms, capped by `backoff_cap`, with
/// +/-15% jitter so that partitions hitting the same Redis outage don't
/// all retry in lockstep.
fn backoff_for(attempt: u32, backoff_cap: Duration) -> Duration {
    let base_millis = 100u64.saturating_mul(1u64 << attempt.min(16));
    let base = Duration::from_millis(base_millis).min(backoff_cap);
    let jitter = rand::thread_rng().gen_range(0.85..=1.15);
    base.mul_f64(jitter).min(backoff_cap)
}

/// Runs one partition worker to completion: drains `receiver` until the
/// router side disconnects (the normal shutdown path), publishing and
/// checkpointing each publication in turn. `initial_checkpoint` is the
/// checkpoint read at startup, used to suppress re-publishing anything
/// already durably recorded before a restart.
#[allow(clippy::too_many_arguments)]
pub fn run_partition(
    partition: usize,
    receiver: Receiver<Publication>,
    redis_url: &str,
    checkpoint_key: &str,
    initial_checkpoint: Option<Checkpoint>,
    max_retries: u32,
    backoff_cap: Duration,
    health: Arc<HealthState>,
) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_connection()?;
    let cas_script = redis::Script::new(crate::checkpoint::CAS_SCRIPT);

    let mut last_checkpoint = initial_checkpoint;
    let mut state = WorkerState::Idle;

    loop {
        let publication = match receiver.recv() {
            Ok(publication) => publication,
            Err(_) => {
                debug!("partition {partition}: upstream disconnected, shutting down");
                return Ok(());
            }
        };

        if let Some(checkpoint) = &last_checkpoint {
            if checkpoint.covers(publication.oplog_timestamp, publication.tx_idx) {
                debug!(
                    "partition {partition}: skipping publication at {} (txIdx {}), already checkpointed",
                    publication.oplog_timestamp, publication.tx_idx
                );
                continue;
            }
        }

        state = WorkerState::Publishing;
        let checkpoint = publish_with_retry(
            partition,
            &mut conn,
            &cas_script,
            checkpoint_key,
            &publication,
            max_retries,
            backoff_cap,
            &mut state,
            &health,
        )?;
        last_checkpoint = Some(checkpoint);
        state = WorkerState::Idle;
        health.leave_backoff(partition);
    }
}

#[allow(clippy::too_many_arguments)]
fn publish_with_retry(
    partition: usize,
    conn: &mut redis::Connection,
    cas_script: &redis::Script,
    checkpoint_key: &str,
    publication: &Publication,
    max_retries: u32,
    backoff_cap: Duration,
    state: &mut WorkerState,
    health: &HealthState,
) -> Result<Checkpoint> {
    let mut attempt = 0u32;
    loop {
        match publish_and_checkpoint(conn, cas_script, checkpoint_key, publication, state) {
            Ok(checkpoint) => {
                health.leave_backoff(partition);
                return Ok(checkpoint);
            }
            Err(source) => {
                if attempt >= max_retries {
                    return Err(Error::RetriesExhausted { partition, source });
                }
                attempt += 1;
                *state = WorkerState::Backoff;
                health.enter_backoff(partition);
                let delay = backoff_for(attempt, backoff_cap);
                warn!(
                    "partition {partition}: publish failed (attempt {attempt}/{max_retries}), retrying in {delay:?}: {source}"
                );
                thread::sleep(delay);
            }
        }
    }
}

fn publish_and_checkpoint(
    conn: &mut redis::Connection,
    cas_script: &redis::Script,
    checkpoint_key: &str,
    publication: &Publication,
    state: &mut WorkerState,
) -> redis::RedisResult<Checkpoint> {
    *state = WorkerState::Publishing;
    for channel in &publication.channels {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&publication.msg)
            .query::<i64>(conn)?;
    }

    *state = WorkerState::Checkpointing;
    let checkpoint = Checkpoint::now(publication.oplog_timestamp, publication.tx_idx);
    let prefix = Checkpoint::sortable_prefix(publication.oplog_timestamp, publication.tx_idx);
    cas_script
        .key(checkpoint_key)
        .arg(checkpoint.encode())
        .arg(prefix)
        .invoke::<i64>(conn)?;

    Ok(checkpoint)
}

/// Whether `ts` at `tx_idx` has already been durably published, per a
/// startup checkpoint read. Exposed so the pipeline can decide whether
/// the tailer itself needs to start later than the oracle's answer would
/// otherwise suggest; in practice the oracle's timestamp already
/// accounts for this and this is mostly useful to tests.
pub fn already_delivered(checkpoint: &Checkpoint, ts: OplogTimestamp, tx_idx: u32) -> bool {
    checkpoint.covers(ts, tx_idx)
}
