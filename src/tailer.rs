//! C2 — the Oplog Tailer.
//!
//! Maintains a tailing cursor over `local.oplog.rs`, decodes raw entries
//! (including transactional `applyOps` bundles), transforms them, and
//! routes the resulting publications to their partition. Grounded on the
//! teacher's `change_stream/mod.rs`: `new_cursor`/`is_error_recoverable`
//! generalize directly into `reopen_cursor`/`classify_error` below, and
//! the buffer-then-pop shape of `impl Iterator for ChangeStream` becomes
//! the inner read loop's `cursor.advance()`/`deserialize_current()` pair.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bson::doc;
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use mongodb::sync::{Client as MongoClient, Cursor};

use crate::health_state::HealthState;
use crate::metrics::{self, Status};
use crate::oplog::{OplogTimestamp, ParsedEntry, RawOplogEntry};
use crate::publisher::{PartitionRouter, RouteError};
use crate::transform::{self, NamespaceFilter};

/// Mongo server error codes meaning "the cursor's position in the oplog
/// was lost" (capped collection rolled past it, or the cursor was
/// otherwise invalidated server-side). Reissuing the find from
/// `lastTimestamp` recovers silently.
const POSITION_LOST_CODES: [i32; 3] = [136, 280, 286];

/// Fixed backoff between fatal-cursor-error restarts, per spec.md §4.2.
const FATAL_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// The pause before inspecting whether a failed read's deadline had
/// elapsed. The driver can surface the underlying network error
/// slightly before its own timeout bookkeeping catches up; waiting
/// briefly makes "was this a timeout?" answerable by checking elapsed
/// wall-clock time against the configured deadline alone.
const TIMEOUT_DETECTION_PAUSE: Duration = Duration::from_millis(100);

/// `stop` is a zero-capacity "close to signal" channel: the supervisor
/// never sends on it, it just drops the sender. Either a successful
/// receive or a disconnected channel means shut down.
fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(
        stop.try_recv(),
        Err(crossbeam_channel::TryRecvError::Empty)
    )
}

pub struct Tailer {
    client: MongoClient,
    query_timeout: Duration,
    prefix: String,
    filter: NamespaceFilter,
    health: Arc<HealthState>,
}

impl Tailer {
    pub fn new(
        client: MongoClient,
        query_timeout: Duration,
        prefix: String,
        filter: NamespaceFilter,
        health: Arc<HealthState>,
    ) -> Self {
        Tailer {
            client,
            query_timeout,
            prefix,
            filter,
            health,
        }
    }

    /// Run until `stop` fires. Never returns on a recoverable error;
    /// only returns (promptly) once `stop` has fired.
    pub fn tail(&self, start: OplogTimestamp, router: &PartitionRouter, stop: &Receiver<()>) {
        let mut last_timestamp = start;

        'outer: loop {
            if stop_requested(stop) {
                return;
            }

            let mut cursor = match self.open_cursor(last_timestamp) {
                Ok(cursor) => cursor,
                Err(err) => {
                    error!("failed to open oplog cursor, retrying in {FATAL_RESTART_BACKOFF:?}: {err}");
                    thread::sleep(FATAL_RESTART_BACKOFF);
                    continue 'outer;
                }
            };

            'inner: loop {
                if stop_requested(stop) {
                    return;
                }

                match cursor.advance() {
                    Ok(true) => {
                        self.health.record_tailer_read();
                        let raw: RawOplogEntry = match cursor.deserialize_current() {
                            Ok(raw) => raw,
                            Err(err) => {
                                warn!("failed to deserialize oplog entry, skipping: {err}");
                                continue 'inner;
                            }
                        };
                        last_timestamp = raw.ts;
                        if let Err(RouteError::Disconnected) = self.process_entry(&raw, router) {
                            return;
                        }
                    }
                    Ok(false) => {
                        // A `TailableAwait` cursor returning no document
                        // with no error means the await period elapsed
                        // with nothing new to read — the expected steady
                        // state when there are no fresh writes. Reissue
                        // from our last confirmed position rather than
                        // blocking this same cursor indefinitely. Mongo
                        // is demonstrably still reachable, so this counts
                        // as a successful read for health purposes.
                        self.health.record_tailer_read();
                        continue 'outer;
                    }
                    Err(err) => {
                        thread::sleep(TIMEOUT_DETECTION_PAUSE);
                        match classify_error(&err) {
                            ErrorClass::LostPosition => {
                                info!("oplog cursor lost its position (code in {POSITION_LOST_CODES:?}); reissuing from {last_timestamp}");
                                continue 'outer;
                            }
                            ErrorClass::Timeout => {
                                continue 'outer;
                            }
                            ErrorClass::Fatal => {
                                error!("fatal oplog cursor error, restarting in {FATAL_RESTART_BACKOFF:?}: {err}");
                                thread::sleep(FATAL_RESTART_BACKOFF);
                                continue 'outer;
                            }
                        }
                    }
                }
            }
        }
    }

    fn open_cursor(&self, from: OplogTimestamp) -> mongodb::error::Result<Cursor<bson::Document>> {
        let coll = self
            .client
            .database("local")
            .collection::<bson::Document>("oplog.rs");

        let opts = mongodb::options::FindOptions::builder()
            .cursor_type(mongodb::options::CursorType::TailableAwait)
            .max_await_time(self.query_timeout)
            .sort(doc! {"$natural": 1})
            .build();

        coll.find(doc! {"ts": {"$gt": from.to_bson_timestamp()}}, opts)
    }

    /// Transform one raw entry, expanding `applyOps` transactions with a
    /// single shared `txIdx` counter, and route each resulting
    /// publication to its partition.
    fn process_entry(
        &self,
        raw: &RawOplogEntry,
        router: &PartitionRouter,
    ) -> Result<(), RouteError> {
        if raw.is_transaction_command() {
            let children = raw.apply_ops_children();
            for (idx, child) in children.into_iter().enumerate() {
                self.process_leaf(&child, idx as u32, router)?;
            }
            return Ok(());
        }
        self.process_leaf(raw, 0, router)
    }

    fn process_leaf(
        &self,
        raw: &RawOplogEntry,
        tx_idx: u32,
        router: &PartitionRouter,
    ) -> Result<(), RouteError> {
        let byte_size = bson::to_vec(&raw.o).map(|b| b.len() as u64).unwrap_or(0);
        let (database, _) = RawOplogEntry::split_namespace(&raw.ns);

        let parsed = match ParsedEntry::from_raw(raw, tx_idx) {
            None => {
                // "c"/"n" ops with no transaction body: nothing to
                // publish, but still observed off the cursor, so they
                // count under the same `ignored` status as an
                // entry the namespace filter drops.
                metrics::record_entry(database, Status::Ignored, byte_size);
                return Ok(());
            }
            Some(Err(err)) => {
                warn!("decode error, skipping entry: {err}");
                metrics::record_entry(database, Status::Error, byte_size);
                return Ok(());
            }
            Some(Ok(parsed)) => parsed,
        };

        match transform::transform(&parsed, &self.prefix, &self.filter) {
            Ok(None) => {
                metrics::record_entry(database, Status::Ignored, byte_size);
                Ok(())
            }
            Ok(Some(publication)) => {
                metrics::record_entry(database, Status::Processed, byte_size);
                router.route(publication)
            }
            Err(err) => {
                warn!("decode error in transformer, skipping entry: {err}");
                metrics::record_entry(database, Status::Error, byte_size);
                Ok(())
            }
        }
    }
}

enum ErrorClass {
    LostPosition,
    Timeout,
    Fatal,
}

fn classify_error(err: &mongodb::error::Error) -> ErrorClass {
    if let Some(code) = err.code() {
        if POSITION_LOST_CODES.contains(&code) {
            return ErrorClass::LostPosition;
        }
    }
    if err.is_network_timeout() {
        return ErrorClass::Timeout;
    }
    ErrorClass::Fatal
}

/// Small extension so call sites can write `err.code()` /
/// `err.is_network_timeout()` regardless of which enum variant of
/// `mongodb::error::ErrorKind` actually carries the detail.
trait MongoErrorExt {
    fn code(&self) -> Option<i32>;
    fn is_network_timeout(&self) -> bool;
}

impl MongoErrorExt for mongodb::error::Error {
    fn code(&self) -> Option<i32> {
        self.kind.code()
    }

    fn is_network_timeout(&self) -> bool {
        self.kind.is_network_timeout()
    }
}

/// Helper trait implemented against `ErrorKind` so the classification
/// above doesn't need to match on every constructor by hand.
trait ErrorKindExt {
    fn code(&self) -> Option<i32>;
    fn is_network_timeout(&self) -> bool;
}

impl ErrorKindExt for mongodb::error::ErrorKind {
    fn code(&self) -> Option<i32> {
        match self {
            mongodb::error::ErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        }
    }

    fn is_network_timeout(&self) -> bool {
        matches!(
            self,
            mongodb::error::ErrorKind::Io(_) | mongodb::error::ErrorKind::ServerSelection { .. }
        )
    }
}
