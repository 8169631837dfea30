use std::collections::HashMap;

/// Which side of the lag equation an offset observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetKind {
    /// Last offset a consumer group committed for a partition.
    Committed,
    /// High watermark of the partition log.
    LogEnd,
}

impl OffsetKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::LogEnd => "log_end",
        }
    }
}

/// A single partition-level offset observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub cluster: String,
    pub topic: String,
    /// Empty for log-end observations.
    pub group: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: OffsetKind,
}

impl PartitionOffset {
    pub fn committed(
        cluster: impl Into<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: i64,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
            group: group.into(),
            partition,
            offset,
            timestamp,
            kind: OffsetKind::Committed,
        }
    }

    pub fn log_end(
        cluster: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: i64,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
            group: String::new(),
            partition,
            offset,
            timestamp,
            kind: OffsetKind::LogEnd,
        }
    }
}

/// Identifies one consumer group's view of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub cluster: String,
    pub topic: String,
    pub group: String,
}

impl GroupKey {
    pub fn new(
        cluster: impl Into<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
            group: group.into(),
        }
    }
}

/// Metric record handed from the aggregator to the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFullOffset {
    pub cluster: String,
    pub topic: String,
    pub group: String,
    pub offset: i64,
    pub max_offset: i64,
    pub lag: i64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ConsumerFullOffset {
    pub fn new(key: &GroupKey, state: &FullOffset) -> Self {
        Self {
            cluster: key.cluster.clone(),
            topic: key.topic.clone(),
            group: key.group.clone(),
            offset: state.offset(),
            max_offset: state.max_offset(),
            lag: state.lag(),
            timestamp: state.timestamp(),
        }
    }
}

/// Running sums of committed and log-end offsets across the partitions of a
/// topic. `offset` and `max_offset` always equal the sums of their partition
/// maps; only [`FullOffset::apply`] changes either.
#[derive(Debug, Clone, Default)]
pub struct FullOffset {
    offset: i64,
    max_offset: i64,
    timestamp: i64,
    committed: HashMap<i32, i64>,
    log_end: HashMap<i32, i64>,
}

impl FullOffset {
    /// A fresh entry that starts from `topic`'s log-end state and has no
    /// committed offsets yet.
    pub fn seeded_from(topic: &FullOffset) -> Self {
        Self {
            offset: 0,
            max_offset: topic.max_offset,
            timestamp: topic.timestamp,
            committed: HashMap::new(),
            log_end: topic.log_end.clone(),
        }
    }

    pub const fn offset(&self) -> i64 {
        self.offset
    }

    pub const fn max_offset(&self) -> i64 {
        self.max_offset
    }

    pub const fn lag(&self) -> i64 {
        self.max_offset - self.offset
    }

    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[cfg(test)]
    pub fn partition_count(&self, kind: OffsetKind) -> usize {
        self.partitions(kind).len()
    }

    #[cfg(test)]
    fn partitions(&self, kind: OffsetKind) -> &HashMap<i32, i64> {
        match kind {
            OffsetKind::Committed => &self.committed,
            OffsetKind::LogEnd => &self.log_end,
        }
    }

    /// Fold one partition observation into the aggregate. Returns `false` when
    /// the partition was already known with the same value.
    pub fn apply(&mut self, partition: i32, kind: OffsetKind, value: i64, timestamp: i64) -> bool {
        let (partitions, total) = match kind {
            OffsetKind::Committed => (&mut self.committed, &mut self.offset),
            OffsetKind::LogEnd => (&mut self.log_end, &mut self.max_offset),
        };

        let previous = partitions.insert(partition, value);
        if previous == Some(value) {
            return false;
        }

        // Negative deltas (group resets, truncated logs) are applied as-is.
        *total += value - previous.unwrap_or(0);
        self.timestamp = self.timestamp.max(timestamp);
        true
    }
}
