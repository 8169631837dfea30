#[cfg(test)]
pub mod strategies {
    use crate::offsets::model::OffsetKind;
    use proptest::prelude::*;

    pub fn arb_offset_kind() -> impl Strategy<Value = OffsetKind> {
        prop_oneof![Just(OffsetKind::Committed), Just(OffsetKind::LogEnd)]
    }

    /// A run of (partition, kind, value) updates over a handful of partitions.
    /// Values go up and down so resets are covered.
    pub fn arb_partition_updates() -> impl Strategy<Value = Vec<(i32, OffsetKind, i64)>> {
        prop::collection::vec((0..8i32, arb_offset_kind(), 0..1_000_000_000i64), 0..64)
    }

    /// Committed-only updates for one topic, as (group index, partition, value)
    pub fn arb_group_commits() -> impl Strategy<Value = Vec<(usize, i32, i64)>> {
        prop::collection::vec((0..3usize, 0..4i32, 0..1_000_000i64), 1..48)
    }

    /// Arbitrary non-empty cluster name
    pub fn arb_cluster_name() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_-]{0,30}"
    }

    /// Arbitrary non-empty group ID
    pub fn arb_group_id() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9._-]{0,48}"
    }
}
