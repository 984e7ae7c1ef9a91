//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate against raft-core's LogStore contract
//! what: persistence, crash recovery, atomic rewrites, edge cases

use raft_core::{LogEntry, LogStore, MemLog, RaftConfig, RaftNode};
use raft_storage::FileStorage;
use std::fs;
use tempfile::tempdir;

fn entries(terms: &[u64]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, &t)| LogEntry::new(t, i as u64, format!("cmd{}", i).into_bytes()))
        .collect()
}

// =============================================================================
// SECTION 1: FILE STORAGE BASICS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft_data");

        FileStorage::new(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(storage.is_empty());
        assert_eq!(storage.last_index(), None);
    }

    #[test]
    fn save_voted_for_none() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(10, None).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (10, None));
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(2)).unwrap();

        assert!(dir.path().join("meta.json").exists());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE LOG
// =============================================================================

mod file_storage_log {
    use super::*;

    #[test]
    fn append_creates_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append(&entries(&[1])).unwrap();

        assert!(dir.path().join("log.jsonl").exists());
    }

    #[test]
    fn append_in_batches() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let all = entries(&[1, 1, 2]);

        for entry in &all {
            storage.append(std::slice::from_ref(entry)).unwrap();
        }

        assert_eq!(storage.len(), 3);
        assert_eq!(storage.last_term(), 2);
        assert_eq!(storage.entries(0, 3).unwrap(), all);
    }

    #[test]
    fn append_with_gap_is_rejected_and_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append(&entries(&[1])).unwrap();
        let before = fs::read(dir.path().join("log.jsonl")).unwrap();

        let err = storage.append(&[LogEntry::new(1, 5, vec![])]).unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert_eq!(fs::read(dir.path().join("log.jsonl")).unwrap(), before);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn truncate_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append(&entries(&[1, 2, 3])).unwrap();

        storage.truncate_from(1).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.term_at(0), Some(1));
        assert_eq!(storage.term_at(1), None);
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append(&entries(&[1, 1])).unwrap();

        storage.truncate_from(5).unwrap();

        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn range_reads_are_clamped() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append(&entries(&[1, 1, 1])).unwrap();

        assert_eq!(storage.entries(1, 99).unwrap().len(), 2);
        assert!(storage.entries(7, 9).unwrap().is_empty());
        assert!(storage.entry(3).unwrap().is_none());
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append(&entries(&[1, 1])).unwrap();
        }

        // "restart"
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let log = storage.entries(0, 2).unwrap();

            assert_eq!(log.len(), 2);
            assert_eq!(log[0].command, b"cmd0".to_vec());
            assert_eq!(log[1].command, b"cmd1".to_vec());
        }
    }

    #[test]
    fn truncation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append(&entries(&[1, 1, 1])).unwrap();
            storage.truncate_from(1).unwrap();
            storage.append(&[LogEntry::new(2, 1, b"replacement".to_vec())]).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.term_at(1), Some(2));
        assert_eq!(storage.entry(1).unwrap().unwrap().command, b"replacement".to_vec());
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();

        // session 1
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(1, Some(1)).unwrap();
            storage.append(&[LogEntry::new(1, 0, b"a".to_vec())]).unwrap();
        }

        // session 2
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(2, Some(2)).unwrap();
            storage.append(&[LogEntry::new(2, 1, b"b".to_vec())]).unwrap();
        }

        // session 3 - verify
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.load_term_and_vote().unwrap(), (2, Some(2)));
            assert_eq!(storage.len(), 2);
            assert_eq!(storage.last_term(), 2);
        }
    }

    #[test]
    fn node_restores_term_and_vote_from_disk() {
        let dir = tempdir().unwrap();
        {
            let store = FileStorage::new(dir.path()).unwrap();
            let mut node = RaftNode::with_store(1, vec![1, 2, 3], RaftConfig::default(), store).unwrap();
            node.start_election().unwrap();
            node.append_entry(b"ignored".to_vec()).unwrap();
        }

        let store = FileStorage::new(dir.path()).unwrap();
        let node = RaftNode::with_store(1, vec![1, 2, 3], RaftConfig::default(), store).unwrap();

        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
        // a candidate never appends, and commit state is not persisted
        assert_eq!(node.last_log_index(), None);
        assert_eq!(node.commit_index, None);
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(3)).unwrap();
        storage.append(&entries(&[1])).unwrap();

        storage.clear().unwrap();

        // files should be gone
        assert!(!dir.path().join("meta.json").exists());
        assert!(!dir.path().join("log.jsonl").exists());
        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.is_empty());
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(2)).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        assert_eq!(meta["term"], 5);
        assert_eq!(meta["voted_for"], 2);
    }

    #[test]
    fn every_log_line_is_a_json_record() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append(&entries(&[1, 1, 2])).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let record: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
            assert_eq!(record["index"], i as u64);
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(2)).unwrap();
        storage.append(&entries(&[1, 1])).unwrap();
        storage.truncate_from(1).unwrap();

        // temp files should be cleaned up
        assert!(!dir.path().join("meta.tmp").exists());
        assert!(!dir.path().join("log.tmp").exists());
    }

    #[test]
    fn out_of_order_file_is_rejected() {
        let dir = tempdir().unwrap();
        let lines = [
            serde_json::to_string(&LogEntry::new(1, 0, vec![])).unwrap(),
            serde_json::to_string(&LogEntry::new(1, 2, vec![])).unwrap(),
        ];
        fs::write(dir.path().join("log.jsonl"), format!("{}\n{}\n", lines[0], lines[1])).unwrap();

        let err = FileStorage::new(dir.path()).unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}

// =============================================================================
// SECTION 5: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        // 1MB command
        let large_command = vec![0u8; 1024 * 1024];
        storage.append(&[LogEntry::new(1, 0, large_command)]).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.entry(0).unwrap().unwrap().command.len(), 1024 * 1024);
    }

    #[test]
    fn many_log_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        let batch: Vec<LogEntry> = (0..1000)
            .map(|i| LogEntry::new(1, i, format!("cmd{}", i).into_bytes()))
            .collect();
        storage.append(&batch).unwrap();

        assert_eq!(FileStorage::new(dir.path()).unwrap().len(), 1000);
    }

    #[test]
    fn binary_and_unicode_commands_round_trip() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let binary = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        let unicode = "SET 键 值 🎉".as_bytes().to_vec();

        storage
            .append(&[LogEntry::new(1, 0, binary.clone()), LogEntry::new(1, 1, unicode.clone())])
            .unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.entry(0).unwrap().unwrap().command, binary);
        assert_eq!(reopened.entry(1).unwrap().unwrap().command, unicode);
    }

    #[test]
    fn very_high_term_number() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(u64::MAX, Some(u64::MAX)).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load_term_and_vote().unwrap(), (u64::MAX, Some(u64::MAX)));
    }
}

// =============================================================================
// SECTION 6: LOGSTORE CONTRACT
// =============================================================================

mod store_contract {
    use super::*;

    fn exercise_store<S: LogStore>(store: &mut S) {
        // save and load term
        store.save_term_and_vote(5, Some(2)).unwrap();
        assert_eq!(store.load_term_and_vote().unwrap(), (5, Some(2)));

        // append and read back
        store.append(&entries(&[1, 1, 3])).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.last_index(), Some(2));
        assert_eq!(store.last_term(), 3);

        // mark committed is inclusive
        store.mark_committed(1);
        let flags: Vec<bool> = store.entries(0, 3).unwrap().iter().map(|e| e.committed).collect();
        assert_eq!(flags, vec![true, true, false]);

        // truncate
        store.truncate_from(0).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.last_term(), 0);
    }

    #[test]
    fn mem_log_satisfies_contract() {
        let mut store = MemLog::new();
        exercise_store(&mut store);
    }

    #[test]
    fn file_storage_satisfies_contract() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::new(dir.path()).unwrap();
        exercise_store(&mut store);
    }
}
