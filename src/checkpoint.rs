//! The resume checkpoint: `(OplogTimestamp, txIdx, wall-clock time at
//! publish)`, persisted in Redis under `<prefix>:lastProcessedEntry` as
//! `<seconds>:<ordinal>:<txIdx>:<wall-time-unix>`. Shared by the Resume
//! Oracle (reads it at startup) and the Redis Publisher (writes it after
//! every successful publish, via a CAS that never regresses, and reads
//! it once at startup to dedup publications already delivered).
//!
//! `txIdx` is carried in the checkpoint, not just `OplogTimestamp`,
//! because every entry inside one `applyOps` transaction bundle shares a
//! single timestamp; without it, a restart mid-transaction could not
//! tell which of that transaction's entries had already been published.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::oplog::OplogTimestamp;

/// Width, in decimal digits, that `seconds` and `ordinal` are zero-padded
/// to in the stored value, so that a plain lexicographic string compare
/// on the leading `PREFIX_LEN` bytes agrees with numeric `(seconds,
/// ordinal, txIdx)` ordering.
const FIELD_WIDTH: usize = 20;
/// Width `txIdx` is zero-padded to; generous relative to a realistic
/// `applyOps` bundle size, but still just a `u32` so 10 digits covers it.
const TX_IDX_WIDTH: usize = 10;
const PREFIX_LEN: usize = FIELD_WIDTH * 2 + TX_IDX_WIDTH + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub ts: OplogTimestamp,
    pub tx_idx: u32,
    pub wall_time_unix: u64,
}

impl Checkpoint {
    pub fn now(ts: OplogTimestamp, tx_idx: u32) -> Self {
        let wall_time_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Checkpoint {
            ts,
            tx_idx,
            wall_time_unix,
        }
    }

    /// The sortable `(seconds, ordinal, txIdx)` prefix alone, used as the
    /// CAS comparison key.
    pub fn sortable_prefix(ts: OplogTimestamp, tx_idx: u32) -> String {
        format!(
            "{:0fwidth$}:{:0fwidth$}:{:0twidth$}",
            ts.seconds,
            ts.ordinal,
            tx_idx,
            fwidth = FIELD_WIDTH,
            twidth = TX_IDX_WIDTH
        )
    }

    /// The full value stored in Redis: the sortable prefix followed by
    /// the wall-clock time, human-decodable and CAS-comparable by its
    /// first `PREFIX_LEN` bytes alone.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}",
            Self::sortable_prefix(self.ts, self.tx_idx),
            self.wall_time_unix
        )
    }

    pub fn decode(raw: &str) -> Option<Checkpoint> {
        let mut parts = raw.splitn(4, ':');
        let seconds: u32 = parts.next()?.parse().ok()?;
        let ordinal: u32 = parts.next()?.parse().ok()?;
        let tx_idx: u32 = parts.next()?.parse().ok()?;
        let wall_time_unix: u64 = parts.next()?.parse().ok()?;
        Some(Checkpoint {
            ts: OplogTimestamp::new(seconds, ordinal),
            tx_idx,
            wall_time_unix,
        })
    }

    /// Whether `self` represents progress strictly past `(ts, tx_idx)`,
    /// i.e. whether a publication at that position has already been
    /// durably checkpointed and can be skipped on replay.
    pub fn covers(&self, ts: OplogTimestamp, tx_idx: u32) -> bool {
        (self.ts, self.tx_idx) >= (ts, tx_idx)
    }

    /// Read and decode the checkpoint currently stored under `key`, if
    /// any. Shared by the resume oracle (at startup, to pick where
    /// tailing resumes) and the publisher (at startup, to dedup).
    pub fn read(conn: &mut redis::Connection, key: &str) -> redis::RedisResult<Option<Checkpoint>> {
        let raw: Option<String> = redis::cmd("GET").arg(key).query(conn)?;
        Ok(raw.and_then(|s| Checkpoint::decode(&s)))
    }
}

/// A small server-side Lua script implementing the compare-and-set: the
/// stored checkpoint is only overwritten if the new value's `(seconds,
/// ordinal)` prefix sorts strictly after the currently stored one's (or
/// nothing is stored yet). `KEYS[1]` is the checkpoint key, `ARGV[1]` the
/// full encoded value to store, `ARGV[2]` its sortable prefix.
pub const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  redis.call('SET', KEYS[1], ARGV[1])
  return 1
end
local current_prefix = string.sub(current, 1, string.len(ARGV[2]))
if ARGV[2] <= current_prefix then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_its_string_encoding() {
        let cp = Checkpoint {
            ts: OplogTimestamp::new(100, 1),
            tx_idx: 3,
            wall_time_unix: 1_700_000_000,
        };
        let encoded = cp.encode();
        assert_eq!(Checkpoint::decode(&encoded), Some(cp));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Checkpoint::decode(""), None);
        assert_eq!(Checkpoint::decode("not-a-checkpoint"), None);
        assert_eq!(Checkpoint::decode("100:1"), None);
        assert_eq!(Checkpoint::decode("100:1:0"), None);
    }

    #[test]
    fn encoded_prefix_length_matches_cas_script_assumption() {
        let cp = Checkpoint::now(OplogTimestamp::new(100, 1), 0);
        let prefix = Checkpoint::sortable_prefix(cp.ts, cp.tx_idx);
        assert_eq!(prefix.len(), PREFIX_LEN);
        assert!(cp.encode().starts_with(&prefix));
    }

    #[test]
    fn sortable_prefix_preserves_numeric_order() {
        let a = Checkpoint::sortable_prefix(OplogTimestamp::new(100, 9), 0);
        let b = Checkpoint::sortable_prefix(OplogTimestamp::new(100, 10), 0);
        assert!(a < b, "ordinal 9 should sort before ordinal 10 when zero-padded");

        let c = Checkpoint::sortable_prefix(OplogTimestamp::new(99, 999), 0);
        let d = Checkpoint::sortable_prefix(OplogTimestamp::new(100, 0), 0);
        assert!(c < d, "seconds dominate ordinal in total ordering");

        let e = Checkpoint::sortable_prefix(OplogTimestamp::new(100, 0), 1);
        let f = Checkpoint::sortable_prefix(OplogTimestamp::new(100, 0), 2);
        assert!(e < f, "txIdx breaks ties within one transaction's shared timestamp");
    }

    #[test]
    fn covers_is_inclusive_of_the_exact_position() {
        let cp = Checkpoint::now(OplogTimestamp::new(100, 1), 2);
        assert!(cp.covers(OplogTimestamp::new(100, 1), 2));
        assert!(cp.covers(OplogTimestamp::new(100, 1), 1));
        assert!(!cp.covers(OplogTimestamp::new(100, 1), 3));
        assert!(!cp.covers(OplogTimestamp::new(100, 2), 0));
    }
}
