//! The error taxonomy surfaced to the supervisor.
//!
//! Transient I/O, lost-cursor-position, and single-entry decode errors
//! are handled locally in `tailer.rs`/`publisher.rs`/`transform.rs` and
//! never become an `Error` value here — per spec, only startup failures
//! and exhausted-retry failures propagate this far.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("decode error: {0}")]
    Decode(#[from] crate::oplog::DecodeError),

    #[error("publication channel closed")]
    ChannelClosed,

    #[error("publish retries exhausted for partition {partition}: {source}")]
    RetriesExhausted {
        partition: usize,
        #[source]
        source: redis::RedisError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
