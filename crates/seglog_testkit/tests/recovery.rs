//! Reopening logs after crashes and on-disk damage.

use seglog_core::{CoreError, Direction};
use seglog_testkit::prelude::*;

const LOG_START: u64 = 64;
// 20 byte payloads in 12 bytes of framing
const FRAME: u64 = 32;

fn record(i: u8) -> Vec<u8> {
    vec![i; 20]
}

fn write_records(dir: &TestDir, count: u8) -> std::path::PathBuf {
    let mut log = open_bytes_log(dir.path(), small_config()).unwrap();
    for i in 0..count {
        log.append(&record(i)).unwrap();
    }
    let head = segment_file(&log, 0, 0).unwrap();
    log.close().unwrap();
    head
}

#[test]
fn torn_write_is_cut_on_reopen() {
    init_tracing();
    let dir = TestDir::new();
    let head = write_records(&dir, 6);
    truncate_file(&head, LOG_START + 5 * FRAME + 16).unwrap();

    let mut log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 5);
    let records: Vec<Vec<u8>> = log.iter(Direction::Forward).unwrap().map(Result::unwrap).collect();
    assert_eq!(records, (0..5).map(record).collect::<Vec<_>>());

    let address = log.append(&record(9)).unwrap();
    assert_eq!(log.get(address).unwrap(), Some(record(9)));
    log.close().unwrap();
    drop(log);

    let log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 6);
}

#[test]
fn garbage_past_the_frontier_is_discarded() {
    init_tracing();
    let dir = TestDir::new();
    let head = write_records(&dir, 6);
    overwrite(&head, LOG_START + 6 * FRAME, 8, 0xFF).unwrap();

    let log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 6);
    assert_eq!(log.iter(Direction::Backward).unwrap().next().unwrap().unwrap(), record(5));
}

#[test]
fn damaged_head_record_is_dropped_with_its_successors() {
    init_tracing();
    let dir = TestDir::new();
    let head = write_records(&dir, 6);
    // first payload byte of the fifth record
    flip_byte(&head, LOG_START + 4 * FRAME + 8).unwrap();
    // without STATE the head is verified from its first record
    std::fs::remove_file(dir.path().join("STATE")).unwrap();

    let log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 4);
}

#[test]
fn reopen_scans_only_past_the_state_checkpoint() {
    init_tracing();
    let dir = TestDir::new();
    let head = write_records(&dir, 6);
    let checkpoint = std::fs::read(dir.path().join("STATE")).unwrap();
    {
        let mut log = open_bytes_log(dir.path(), small_config()).unwrap();
        log.append(&record(6)).unwrap();
        log.append(&record(7)).unwrap();
        log.close().unwrap();
    }
    // STATE as it was before the last two appends, as after a crash
    std::fs::write(dir.path().join("STATE"), checkpoint).unwrap();
    // damage before the checkpoint is not rescanned
    flip_byte(&head, LOG_START + 2 * FRAME + 8).unwrap();

    let mut log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 8);
    let newest: Vec<Vec<u8>> = log
        .iter(Direction::Backward)
        .unwrap()
        .take(2)
        .map(Result::unwrap)
        .collect();
    assert_eq!(newest, vec![record(7), record(6)]);
    let address = log.append(&record(8)).unwrap();
    assert_eq!(log.get(address).unwrap(), Some(record(8)));
}

#[test]
fn checkpoint_off_a_record_boundary_falls_back_to_full_scan() {
    init_tracing();
    let dir = TestDir::new();
    let head = write_records(&dir, 6);
    // the record ending at the checkpoint no longer verifies
    flip_byte(&head, LOG_START + 5 * FRAME + 8).unwrap();

    let log = open_bytes_log(dir.path(), small_config()).unwrap();
    assert_eq!(log.entries(), 5);
}

#[test]
fn rolled_segment_checksums_follow_probability() {
    init_tracing();
    let dir = TestDir::new();
    let mut log = open_bytes_log(dir.path(), small_config()).unwrap();
    let first = log.append(&record(1)).unwrap();
    log.append(&record(2)).unwrap();
    log.roll().unwrap();
    let rolled = segment_file(&log, 1, 0).unwrap();
    log.close().unwrap();
    drop(log);

    flip_byte(&rolled, LOG_START + 8).unwrap();

    let mut log = open_bytes_log(dir.path(), small_config().checksum_probability(1.0)).unwrap();
    assert!(matches!(log.get(first), Err(CoreError::ChecksumMismatch { .. })));
    log.close().unwrap();
    drop(log);

    let log = open_bytes_log(dir.path(), small_config().checksum_probability(0.0)).unwrap();
    let read = log.get(first).unwrap().unwrap();
    assert_ne!(read, record(1));
    assert_eq!(read[1..], record(1)[1..]);
}
