//! Offset Tracker - records the highest handled offset per partition
//!
//! Only the dispatch stage advances it (after a handler succeeded) and only the
//! commit stage reads it. A partition's committed offset never passes its last
//! handled offset, so nothing is committed that was not confirmed handled.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::metrics_consts::OFFSET_TRACKER_OUT_OF_ORDER;

#[derive(Debug, Clone, Copy)]
struct PartitionState {
    /// Offset of the last record whose handler returned successfully
    handled_offset: i64,
    /// Last handled offset covered by a successful commit
    committed_offset: Option<i64>,
}

/// Per-consumer offset bookkeeping. Private to one consumer instance.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the record at `offset` was handled. Offsets only move forward.
    pub fn mark_handled(&mut self, partition: i32, offset: i64) {
        match self.partitions.get_mut(&partition) {
            Some(state) if offset <= state.handled_offset => {
                warn!(
                    partition,
                    offset,
                    handled_offset = state.handled_offset,
                    "Handled offset did not advance"
                );
                metrics::counter!(OFFSET_TRACKER_OUT_OF_ORDER, "partition" => partition.to_string())
                    .increment(1);
            }
            Some(state) => {
                state.handled_offset = offset;
            }
            None => {
                debug!(partition, offset, "Tracking new partition");
                self.partitions.insert(
                    partition,
                    PartitionState {
                        handled_offset: offset,
                        committed_offset: None,
                    },
                );
            }
        }
    }

    pub fn last_handled(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).map(|s| s.handled_offset)
    }

    pub fn last_committed(&self, partition: i32) -> Option<i64> {
        self.partitions
            .get(&partition)
            .and_then(|s| s.committed_offset)
    }

    /// Offsets to commit for partitions that advanced since their last commit.
    ///
    /// Values follow the Kafka convention: the next offset to consume, i.e.
    /// last handled + 1.
    pub fn committable_offsets(&self) -> HashMap<i32, i64> {
        self.partitions
            .iter()
            .filter(|(_, s)| s.committed_offset.map_or(true, |c| c < s.handled_offset))
            .map(|(p, s)| (*p, s.handled_offset + 1))
            .collect()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.partitions
            .values()
            .any(|s| s.committed_offset.map_or(true, |c| c < s.handled_offset))
    }

    /// Mark offsets returned by [`Self::committable_offsets`] as committed.
    pub fn mark_committed(&mut self, offsets: &HashMap<i32, i64>) {
        for (partition, next_offset) in offsets {
            let Some(state) = self.partitions.get_mut(partition) else {
                continue;
            };
            let committed = (*next_offset - 1).min(state.handled_offset);
            if state.committed_offset.map_or(true, |c| committed > c) {
                state.committed_offset = Some(committed);
            }
        }
    }

    /// Drop all state, when the consumer is closed.
    pub fn clear_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
