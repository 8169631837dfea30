use crate::offsets::model::{ConsumerFullOffset, FullOffset, GroupKey, OffsetKind, PartitionOffset};
use std::collections::HashMap;
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicKey {
    cluster: String,
    topic: String,
}

#[derive(Debug, Default)]
struct TopicState {
    log_end: FullOffset,
    groups: HashMap<String, FullOffset>,
}

/// Folds partition-level offset observations into per-group full offsets.
///
/// Log-end offsets are tracked once per (cluster, topic) and mirrored into
/// every group of that topic, so each group's `max_offset` stays derived from
/// its own partition state. Entries are never evicted.
///
/// Not synchronised: callers sharing one aggregator across tasks must
/// serialise access themselves.
#[derive(Debug, Default)]
pub struct OffsetAggregator {
    topics: HashMap<TopicKey, TopicState>,
}

impl OffsetAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one partition's value into the full offset for `key`. Returns the
    /// new snapshot, or `None` when nothing changed.
    ///
    /// Log-end values are also recorded at topic level so groups seen later
    /// start from the same log-end state. Other groups of the topic are left
    /// untouched; use [`OffsetAggregator::apply`] to fan a log-end value out.
    pub fn update(
        &mut self,
        key: &GroupKey,
        partition: i32,
        kind: OffsetKind,
        value: i64,
        timestamp: i64,
    ) -> Option<ConsumerFullOffset> {
        let TopicState { log_end, groups } = self.topic_state(&key.cluster, &key.topic);
        let state = groups
            .entry(key.group.clone())
            .or_insert_with(|| FullOffset::seeded_from(&*log_end));
        if kind == OffsetKind::LogEnd {
            log_end.apply(partition, kind, value, timestamp);
        }

        if !state.apply(partition, kind, value, timestamp) {
            return None;
        }

        trace!(
            cluster = %key.cluster,
            topic = %key.topic,
            group = %key.group,
            partition,
            kind = kind.as_str(),
            value,
            "Applied partition offset"
        );
        Some(ConsumerFullOffset::new(key, state))
    }

    /// Route a raw observation. Committed offsets update their own group; a
    /// log-end offset updates the topic and every group tracked for it.
    pub fn apply(&mut self, event: &PartitionOffset) -> Vec<ConsumerFullOffset> {
        match event.kind {
            OffsetKind::Committed => {
                if event.group.is_empty() {
                    warn!(
                        cluster = %event.cluster,
                        topic = %event.topic,
                        partition = event.partition,
                        "Committed offset without consumer group, ignoring"
                    );
                    return Vec::new();
                }
                let key = GroupKey::new(&event.cluster, &event.topic, &event.group);
                self.update(
                    &key,
                    event.partition,
                    event.kind,
                    event.offset,
                    event.timestamp,
                )
                .into_iter()
                .collect()
            }
            OffsetKind::LogEnd => self.apply_log_end(event),
        }
    }

    fn apply_log_end(&mut self, event: &PartitionOffset) -> Vec<ConsumerFullOffset> {
        let topic = self.topic_state(&event.cluster, &event.topic);
        topic
            .log_end
            .apply(event.partition, OffsetKind::LogEnd, event.offset, event.timestamp);

        let mut records = Vec::new();
        for (group, state) in &mut topic.groups {
            if state.apply(
                event.partition,
                OffsetKind::LogEnd,
                event.offset,
                event.timestamp,
            ) {
                let key = GroupKey::new(&event.cluster, &event.topic, group);
                records.push(ConsumerFullOffset::new(&key, state));
            }
        }
        records
    }

    /// Current state for a group, if it has been observed.
    #[cfg(test)]
    pub fn get(&self, key: &GroupKey) -> Option<&FullOffset> {
        self.topics
            .get(&TopicKey {
                cluster: key.cluster.clone(),
                topic: key.topic.clone(),
            })
            .and_then(|t| t.groups.get(&key.group))
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn group_count(&self) -> usize {
        self.topics.values().map(|t| t.groups.len()).sum()
    }

    fn topic_state(&mut self, cluster: &str, topic: &str) -> &mut TopicState {
        self.topics
            .entry(TopicKey {
                cluster: cluster.to_string(),
                topic: topic.to_string(),
            })
            .or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_strategies::strategies::arb_group_commits;
    use proptest::prelude::*;

    fn key(group: &str) -> GroupKey {
        GroupKey::new("c1", "orders", group)
    }

    #[test]
    fn test_partition_reset_example() {
        let mut agg = OffsetAggregator::new();
        let k = key("billing");

        agg.update(&k, 0, OffsetKind::Committed, 100, 1_000);
        let r = agg.update(&k, 1, OffsetKind::Committed, 200, 1_000).unwrap();
        assert_eq!(r.offset, 300);

        let r = agg.update(&k, 0, OffsetKind::Committed, 150, 2_000).unwrap();
        assert_eq!(r.offset, 350);

        let r = agg.update(&k, 1, OffsetKind::Committed, 150, 3_000).unwrap();
        assert_eq!(r.offset, 300);
        assert_eq!(r.timestamp, 3_000);
    }

    #[test]
    fn test_duplicate_update_yields_no_record() {
        let mut agg = OffsetAggregator::new();
        let k = key("billing");

        assert!(agg.update(&k, 0, OffsetKind::Committed, 10, 1_000).is_some());
        assert!(agg.update(&k, 0, OffsetKind::Committed, 10, 2_000).is_none());
        assert_eq!(agg.get(&k).unwrap().offset(), 10);
    }

    #[test]
    fn test_record_carries_identity_and_lag() {
        let mut agg = OffsetAggregator::new();
        agg.apply(&PartitionOffset::log_end("c1", "orders", 0, 500, 1_000));
        let records = agg.apply(&PartitionOffset::committed(
            "c1", "orders", "billing", 0, 420, 2_000,
        ));

        assert_eq!(
            records,
            vec![ConsumerFullOffset {
                cluster: "c1".to_string(),
                topic: "orders".to_string(),
                group: "billing".to_string(),
                offset: 420,
                max_offset: 500,
                lag: 80,
                timestamp: 2_000,
            }]
        );
    }

    #[test]
    fn test_log_end_fans_out_to_all_groups_of_topic() {
        let mut agg = OffsetAggregator::new();
        agg.apply(&PartitionOffset::committed("c1", "orders", "a", 0, 10, 1_000));
        agg.apply(&PartitionOffset::committed("c1", "orders", "b", 0, 20, 1_000));
        agg.apply(&PartitionOffset::committed("c1", "payments", "a", 0, 5, 1_000));

        let mut records = agg.apply(&PartitionOffset::log_end("c1", "orders", 0, 100, 2_000));
        records.sort_by(|x, y| x.group.cmp(&y.group));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].group, "a");
        assert_eq!(records[0].lag, 90);
        assert_eq!(records[1].group, "b");
        assert_eq!(records[1].lag, 80);
        assert_eq!(agg.get(&GroupKey::new("c1", "payments", "a")).unwrap().max_offset(), 0);
    }

    #[test]
    fn test_unchanged_log_end_yields_no_records() {
        let mut agg = OffsetAggregator::new();
        agg.apply(&PartitionOffset::committed("c1", "orders", "a", 0, 10, 1_000));
        assert_eq!(
            agg.apply(&PartitionOffset::log_end("c1", "orders", 0, 100, 2_000)).len(),
            1
        );
        assert!(agg
            .apply(&PartitionOffset::log_end("c1", "orders", 0, 100, 3_000))
            .is_empty());
    }

    #[test]
    fn test_group_seen_after_log_end_starts_from_topic_state() {
        let mut agg = OffsetAggregator::new();
        agg.apply(&PartitionOffset::log_end("c1", "orders", 0, 300, 1_000));
        agg.apply(&PartitionOffset::log_end("c1", "orders", 1, 400, 1_000));

        let records = agg.apply(&PartitionOffset::committed("c1", "orders", "late", 1, 350, 2_000));
        assert_eq!(records[0].max_offset, 700);
        assert_eq!(records[0].offset, 350);
        assert_eq!(records[0].lag, 350);
    }

    #[test]
    fn test_log_end_update_on_new_group_is_a_change() {
        let mut agg = OffsetAggregator::new();
        let r = agg.update(&key("fresh"), 0, OffsetKind::LogEnd, 50, 1_000).unwrap();
        assert_eq!(r.max_offset, 50);
        assert_eq!(r.lag, 50);

        let other = agg.update(&key("other"), 0, OffsetKind::Committed, 20, 1_000).unwrap();
        assert_eq!(other.max_offset, 50);
    }

    #[test]
    fn test_committed_without_group_is_ignored() {
        let mut agg = OffsetAggregator::new();
        let records = agg.apply(&PartitionOffset::committed("c1", "orders", "", 0, 10, 1_000));
        assert!(records.is_empty());
        assert_eq!(agg.group_count(), 0);
    }

    #[test]
    fn test_clusters_are_tracked_independently() {
        let mut agg = OffsetAggregator::new();
        agg.apply(&PartitionOffset::committed("c1", "orders", "a", 0, 10, 1_000));
        agg.apply(&PartitionOffset::committed("c2", "orders", "a", 0, 99, 1_000));

        assert_eq!(agg.topic_count(), 2);
        assert_eq!(agg.group_count(), 2);
        assert_eq!(agg.get(&GroupKey::new("c1", "orders", "a")).unwrap().offset(), 10);
        assert_eq!(agg.get(&GroupKey::new("c2", "orders", "a")).unwrap().offset(), 99);
    }

    proptest! {
        /// Each group's offset equals the sum of its latest committed value per partition
        #[test]
        fn prop_group_offsets_match_latest_values(commits in arb_group_commits()) {
            let mut agg = OffsetAggregator::new();
            let mut latest: HashMap<(usize, i32), i64> = HashMap::new();

            for (group, partition, value) in commits {
                let k = key(&format!("g{group}"));
                agg.update(&k, partition, OffsetKind::Committed, value, 0);
                latest.insert((group, partition), value);
            }

            for group in 0..3usize {
                let expected: i64 = latest
                    .iter()
                    .filter(|((g, _), _)| *g == group)
                    .map(|(_, v)| *v)
                    .sum();
                let actual = agg
                    .get(&key(&format!("g{group}")))
                    .map_or(0, FullOffset::offset);
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
