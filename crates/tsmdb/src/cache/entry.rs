//! Per-series value buffer.

use crate::tsm::{BlockType, TimeRange, Timestamp, Value};

/// Values of one series, sorted by timestamp with one value per timestamp.
///
/// Each value carries the WAL sequence number that wrote it; on a timestamp
/// collision the value with the higher (or equal, if later) sequence wins.
#[derive(Debug, Clone)]
pub struct Entry {
    values: Vec<(Value, u64)>,
    block_type: BlockType,
}

impl Entry {
    /// Creates an empty entry for one payload kind.
    pub fn new(block_type: BlockType) -> Self {
        Self {
            values: Vec::new(),
            block_type,
        }
    }

    /// Payload kind of the series.
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    /// Merges `values` written at `sequence`.
    ///
    /// The caller has checked that every value matches [`Self::block_type`].
    pub fn add(&mut self, values: &[Value], sequence: u64) {
        self.merge(values.iter().map(|v| (v.clone(), sequence)));
    }

    /// Merges sequence-tagged values, resolving collisions by sequence.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = (Value, u64)>) {
        let start = self.values.len();
        self.values.extend(incoming);
        if self.values.len() == start {
            return;
        }

        let appended_in_order = self.values[start.saturating_sub(1)..]
            .windows(2)
            .all(|w| w[0].0.timestamp < w[1].0.timestamp);
        if appended_in_order {
            return;
        }

        // Stable: among equal sequences the later write stays behind the earlier.
        self.values.sort_by_key(|(v, _)| v.timestamp);
        self.values.dedup_by(|later, kept| {
            if later.0.timestamp != kept.0.timestamp {
                return false;
            }
            if later.1 >= kept.1 {
                std::mem::swap(later, kept);
            }
            true
        });
    }

    /// Removes values with `min <= timestamp <= max`. Returns how many were removed.
    pub fn remove_range(&mut self, min: Timestamp, max: Timestamp) -> usize {
        let before = self.values.len();
        self.values
            .retain(|(v, _)| v.timestamp < min || v.timestamp > max);
        before - self.values.len()
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the entry holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sequence-tagged values, sorted by timestamp.
    pub fn tagged(&self) -> &[(Value, u64)] {
        &self.values
    }

    /// Sequence-tagged values within `range`.
    pub fn tagged_in_range(&self, range: TimeRange) -> &[(Value, u64)] {
        let lo = self.values.partition_point(|(v, _)| v.timestamp < range.start);
        let hi = self.values.partition_point(|(v, _)| v.timestamp < range.end);
        &self.values[lo..hi.max(lo)]
    }

    /// Copies out the values without sequence tags.
    pub fn values(&self) -> Vec<Value> {
        self.values.iter().map(|(v, _)| v.clone()).collect()
    }
}

/// Merges sequence-tagged runs from several generations into one sorted,
/// deduplicated run.
pub(crate) fn merge_tagged(runs: Vec<Vec<(Value, u64)>>) -> Vec<Value> {
    let mut runs = runs.into_iter().filter(|r| !r.is_empty());
    let Some(first) = runs.next() else {
        return Vec::new();
    };
    let Some(block_type) = first.first().map(|(v, _)| v.block_type()) else {
        return Vec::new();
    };

    let mut entry = Entry::new(block_type);
    entry.values = first;
    for run in runs {
        entry.merge(run);
    }
    entry.values.into_iter().map(|(v, _)| v).collect()
}
