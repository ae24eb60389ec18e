//! Property-based test generators using proptest.
//!
//! Provides strategies for log records and sorted index entry runs.

use proptest::prelude::*;
use seglog_core::IndexEntry;

/// Strategy for one non-empty record payload of up to `max_len` bytes.
pub fn payload_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len.max(1))
}

/// Strategy for a batch of 1 to `max_records` payloads.
pub fn records_strategy(max_records: usize, max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(payload_strategy(max_len), 1..=max_records.max(1))
}

/// Strategy for printable, non-empty string records.
pub fn string_record_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 ]{1,64}").expect("Invalid regex")
}

/// Strategy for `(stream, versions)` runs: distinct streams, each with
/// 1 to `max_versions` versions.
pub fn stream_runs_strategy(max_streams: usize, max_versions: i32) -> impl Strategy<Value = Vec<(i64, i32)>> {
    prop::collection::btree_map(any::<i64>(), 1..=max_versions.max(1), 1..=max_streams.max(1))
        .prop_map(|runs| runs.into_iter().collect())
}

/// Expands runs into sorted index entries.
///
/// Version `v` of stream `s` points at position `s.wrapping_mul(31) + v`.
pub fn index_entries(runs: &[(i64, i32)]) -> Vec<IndexEntry> {
    let mut entries: Vec<IndexEntry> = runs
        .iter()
        .flat_map(|&(stream, versions)| {
            (1..=versions).map(move |version| IndexEntry::new(stream, version, entry_position(stream, version)))
        })
        .collect();
    entries.sort();
    entries
}

/// Position [`index_entries`] assigns to `(stream, version)`.
pub fn entry_position(stream: i64, version: i32) -> i64 {
    stream.wrapping_mul(31).wrapping_add(i64::from(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn entries_are_sorted_and_complete() {
        let entries = index_entries(&[(5, 2), (-3, 1), (9, 3)]);
        assert_eq!(entries.len(), 6);
        assert!(entries.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(entries[0], IndexEntry::key(-3, 1));
        assert_eq!(entries[5].position, entry_position(9, 3));
    }

    #[test]
    fn payloads_are_never_empty() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let payload = payload_strategy(8).new_tree(&mut runner).unwrap().current();
            assert!(!payload.is_empty() && payload.len() <= 8);
        }
    }
}
