//! Per-partition commit watermarks.
//!
//! Workers finish messages out of order, so a finished offset can only be
//! committed once every earlier offset of its partition has finished too.
//! The tracker records fetched offsets as in flight and reports the new
//! commit position whenever the low watermark moves.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

/// A topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition number.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a topic partition.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Debug)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    highest_completed: Option<i64>,
    /// Position the group already stood at before the first tracked offset.
    baseline: i64,
    committed: Option<i64>,
}

impl PartitionState {
    fn starting_at(offset: i64) -> Self {
        Self {
            in_flight: BTreeSet::new(),
            highest_completed: None,
            baseline: offset,
            committed: None,
        }
    }

    fn watermark(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(&lowest_pending) => Some(lowest_pending),
            None => self.highest_completed.map(|offset| offset + 1),
        }
    }
}

/// Tracks in-flight offsets and computes commit positions.
///
/// Offsets must be tracked in fetch order, which is ascending within a
/// partition. A commit position is the offset of the next message to
/// consume, so everything below it has completed.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<TopicPartition, PartitionState>,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fetched offset as in flight.
    pub fn track(&mut self, tp: &TopicPartition, offset: i64) {
        self.partitions
            .entry(tp.clone())
            .or_insert_with(|| PartitionState::starting_at(offset))
            .in_flight
            .insert(offset);
    }

    /// Marks an offset finished.
    ///
    /// Returns the new commit position if the watermark advanced past the
    /// last returned position, or past the first tracked offset before any
    /// position was returned.
    pub fn complete(&mut self, tp: &TopicPartition, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(tp)?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.highest_completed = state.highest_completed.max(Some(offset));

        let watermark = state.watermark()?;
        if watermark <= state.committed.unwrap_or(state.baseline) {
            return None;
        }
        state.committed = Some(watermark);
        Some(watermark)
    }

    /// Returns the last commit position reported for a partition.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).and_then(|state| state.committed)
    }

    /// Returns the number of offsets tracked but not completed.
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|state| state.in_flight.len()).sum()
    }
}
