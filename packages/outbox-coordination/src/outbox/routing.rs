//! Shard-to-event routing.
//!
//! Each event carries an `i32` routing hash. A shard `(N, i)` owns a
//! contiguous, inclusive range of that space, and the ranges of one `N` never
//! overlap, so two agents with distinct shards never query the same event.

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{OutboxEventId, OutboxTransaction};
use crate::agent::ShardAssignment;
use crate::error::StoreError;

/// Hash used to route an entity's events to a shard.
///
/// First four bytes of the SHA-256 digest, big-endian. Stable across
/// processes and platforms.
pub fn routing_hash(key: &str) -> i32 {
    let digest = Sha256::digest(key.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Inclusive range of routing hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingRange {
    pub start: i32,
    pub end: i32,
}

impl RoutingRange {
    pub const ALL: RoutingRange = RoutingRange {
        start: i32::MIN,
        end: i32::MAX,
    };

    pub fn contains(&self, hash: i32) -> bool {
        self.start <= hash && hash <= self.end
    }
}

impl fmt::Display for RoutingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Maps a shard to the routing hashes it owns.
///
/// Implementations must be pure and must partition the whole `i32` space for
/// any given total.
pub trait RangeFunction: Send + Sync {
    fn range_for(&self, assignment: ShardAssignment) -> RoutingRange;
}

/// Splits the hash space into `N` equal contiguous buckets; the last bucket
/// absorbs the remainder.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformHashRanges;

impl RangeFunction for UniformHashRanges {
    fn range_for(&self, assignment: ShardAssignment) -> RoutingRange {
        let total = i64::from(assignment.total());
        let index = i64::from(assignment.index());
        let width = (1i64 << 32) / total;

        let start = i64::from(i32::MIN) + index * width;
        let end = if index + 1 == total {
            i64::from(i32::MAX)
        } else {
            start + width - 1
        };

        // Both bounds lie in the i32 space by construction.
        RoutingRange {
            start: start as i32,
            end: end as i32,
        }
    }
}

/// Permission to read the due events of one shard.
///
/// Only handed out by the event-processor policy while the agent is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEventQuery {
    assignment: ShardAssignment,
    range: RoutingRange,
}

impl ShardEventQuery {
    pub(crate) fn new(assignment: ShardAssignment, range_function: &dyn RangeFunction) -> Self {
        Self {
            assignment,
            range: range_function.range_for(assignment),
        }
    }

    pub fn assignment(&self) -> ShardAssignment {
        self.assignment
    }

    pub fn range(&self) -> RoutingRange {
        self.range
    }

    /// Ids of this shard's pending events due at `now`.
    pub async fn find_due(
        &self,
        tx: &mut dyn OutboxTransaction,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEventId>, StoreError> {
        tx.find_due(self.range, now, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(total: u32) -> Vec<RoutingRange> {
        (0..total)
            .map(|index| UniformHashRanges.range_for(ShardAssignment::new(total, index).unwrap()))
            .collect()
    }

    #[test]
    fn single_shard_owns_everything() {
        assert_eq!(ranges(1), vec![RoutingRange::ALL]);
    }

    #[test]
    fn ranges_partition_the_hash_space() {
        for total in [2, 3, 5, 7, 16, 100] {
            let ranges = ranges(total);
            assert_eq!(ranges.first().unwrap().start, i32::MIN);
            assert_eq!(ranges.last().unwrap().end, i32::MAX);
            for pair in ranges.windows(2) {
                assert!(pair[0].start <= pair[0].end);
                assert_eq!(i64::from(pair[0].end) + 1, i64::from(pair[1].start));
            }
        }
    }

    #[test]
    fn every_hash_has_exactly_one_owner() {
        let ranges = ranges(3);
        for key in ["a", "b", "book-1", "book-2", "author-99", ""] {
            let hash = routing_hash(key);
            let owners = ranges.iter().filter(|r| r.contains(hash)).count();
            assert_eq!(owners, 1, "hash of {:?}", key);
        }
    }

    #[test]
    fn routing_hash_is_stable() {
        assert_eq!(routing_hash("book-1"), routing_hash("book-1"));
        assert_ne!(routing_hash("book-1"), routing_hash("book-2"));
    }
}
