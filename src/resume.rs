//! C1 — the Resume Oracle.
//!
//! Decides the oplog timestamp tailing must (re)start from, per the four
//! policy branches in spec.md §4.1. Mirrors the teacher's
//! `ChangeStreamOptions` resume fields (`resume_after`,
//! `start_at_operation_time`) conceptually: both are "where do we pick
//! the stream back up," just backed by a Redis key instead of a
//! server-held resume token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bson::doc;
use log::{error, info, warn};
use mongodb::sync::Client as MongoClient;

use crate::checkpoint::Checkpoint;
use crate::oplog::OplogTimestamp;

/// Decide the start timestamp for a fresh tailing session.
///
/// `redis_conn` and `mongo_client` failures are both logged and handled
/// by falling through to the next policy branch; neither is fatal here,
/// since tailing must always be able to start.
pub fn start(
    redis_conn: &mut redis::Connection,
    mongo_client: &MongoClient,
    checkpoint_key: &str,
    max_catch_up: Duration,
) -> OplogTimestamp {
    match Checkpoint::read(redis_conn, checkpoint_key) {
        Ok(Some(checkpoint)) => {
            if checkpoint_is_fresh(&checkpoint, max_catch_up) {
                info!(
                    "resuming from persisted checkpoint at {}",
                    checkpoint.ts
                );
                return checkpoint.ts;
            }
            warn!(
                "persisted checkpoint at {} is older than maxCatchUp ({:?}); jumping to now instead of replaying an unbounded backlog",
                checkpoint.ts, max_catch_up
            );
        }
        Ok(None) => {
            info!("no persisted checkpoint found; starting from the current end of the oplog");
        }
        Err(err) => {
            warn!("failed to read resume checkpoint from redis, falling through: {err}");
        }
    }

    match latest_oplog_timestamp(mongo_client) {
        Ok(Some(ts)) => {
            info!("starting from the newest oplog entry at {ts}");
            ts
        }
        Ok(None) => {
            warn!("oplog.rs is empty; synthesizing a start timestamp from wall-clock time");
            wall_clock_fallback()
        }
        Err(err) => {
            error!("failed to query mongo for the newest oplog entry, synthesizing a start timestamp from wall-clock time: {err}");
            wall_clock_fallback()
        }
    }
}

fn checkpoint_is_fresh(checkpoint: &Checkpoint, max_catch_up: Duration) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_sub(checkpoint.wall_time_unix) < max_catch_up.as_secs()
}

fn latest_oplog_timestamp(client: &MongoClient) -> mongodb::error::Result<Option<OplogTimestamp>> {
    let coll = client.database("local").collection::<bson::Document>("oplog.rs");
    let find_opts = mongodb::options::FindOptions::builder()
        .sort(doc! {"$natural": -1})
        .limit(1)
        .build();
    let mut cursor = coll.find(doc! {}, find_opts)?;
    if cursor.advance()? {
        let doc = cursor.deserialize_current()?;
        let ts = doc.get_timestamp("ts").ok();
        return Ok(ts.map(|t| OplogTimestamp::new(t.time, t.increment)));
    }
    Ok(None)
}

/// Wall-clock fallback timestamp, used only when Mongo itself cannot be
/// queried at all.
///
/// The source system's equivalent of this fallback shifts the current
/// unix time into the high 32 bits of a 64-bit timestamp, which
/// overflows a `u32` and is almost certainly a bug; the correct and
/// intended behavior — reproduced here — is `{seconds: now_unix, ordinal:
/// 0}`, i.e. the same shape `OplogTimestamp` uses everywhere else.
fn wall_clock_fallback() -> OplogTimestamp {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    OplogTimestamp::new(now_unix as u32, 0)
}
