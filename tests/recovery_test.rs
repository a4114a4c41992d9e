use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use cannondb::{CannonDb, CannonError, DbConfig, Value};

use rand::prelude::*;
use tempfile::TempDir;

fn scratch() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.db");
    (dir, path)
}

fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

fn truncate_file(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
    file.sync_all().unwrap();
}

/// Committed-but-not-checkpointed data survives a crash (dropping the
/// handle without close).
#[test]
fn test_recovery_replays_committed_data() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..500 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    drop(db); // crash: no checkpoint, no close

    let db = CannonDb::open(&path, config).unwrap();
    assert_eq!(db.len().unwrap(), 500);
    for k in 0..500 {
        assert_eq!(db.get(&Value::Int(k)).unwrap(), Value::Int(k));
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
}

/// Uncommitted work vanishes at a crash; the last commit record wins.
#[test]
fn test_crash_discards_uncommitted_tail() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..100 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    for k in 100..200 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    drop(db); // crash with the second hundred uncommitted

    let db = CannonDb::open(&path, config).unwrap();
    assert_eq!(db.len().unwrap(), 100);
    for k in 0..100 {
        assert_eq!(db.get(&Value::Int(k)).unwrap(), Value::Int(k));
    }
    assert!(matches!(
        db.get(&Value::Int(150)),
        Err(CannonError::NotFound)
    ));
    db.close().unwrap();
}

/// Chopping the log back to a commit-record boundary reproduces exactly
/// the state as of that record.
#[test]
fn test_truncating_wal_at_commit_boundary() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..100 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    let len_after_first = std::fs::metadata(wal_path(&path)).unwrap().len();
    for k in 100..200 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    drop(db);

    truncate_file(&wal_path(&path), len_after_first);

    let db = CannonDb::open(&path, config).unwrap();
    assert_eq!(db.len().unwrap(), 100);
    db.check_integrity().unwrap();
    db.close().unwrap();
}

/// Removing just the trailing commit record discards the whole final
/// group, not part of it.
#[test]
fn test_torn_commit_record_discards_group() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..100 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    for k in 100..200 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    drop(db);

    let wal = wal_path(&path);
    let len = std::fs::metadata(&wal).unwrap().len();
    // A commit record is a 12-byte frame header with no payload.
    truncate_file(&wal, len - 12);

    let db = CannonDb::open(&path, config).unwrap();
    assert_eq!(db.len().unwrap(), 100);
    assert!(matches!(
        db.get(&Value::Int(199)),
        Err(CannonError::NotFound)
    ));
    db.close().unwrap();
}

/// Truncating mid-frame behaves the same as losing the group.
#[test]
fn test_truncating_mid_frame_discards_group() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..50 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    let boundary = std::fs::metadata(wal_path(&path)).unwrap().len();
    for k in 50..100 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    drop(db);

    truncate_file(&wal_path(&path), boundary + 37);

    let db = CannonDb::open(&path, config).unwrap();
    assert_eq!(db.len().unwrap(), 50);
    db.close().unwrap();
}

/// Recovery is idempotent: crashing again right after a recovery changes
/// nothing.
#[test]
fn test_recovery_is_idempotent() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..300 {
        db.insert(Value::Int(k), Value::Int(k * 3), false).unwrap();
    }
    db.commit().unwrap();
    drop(db);

    for _ in 0..3 {
        let db = CannonDb::open(&path, config.clone()).unwrap();
        assert_eq!(db.len().unwrap(), 300);
        assert_eq!(db.get(&Value::Int(7)).unwrap(), Value::Int(21));
        drop(db); // crash again without close
    }
    let db = CannonDb::open(&path, config).unwrap();
    db.check_integrity().unwrap();
    db.close().unwrap();
}

/// A flipped byte inside a sealed frame group fails the open outright.
#[test]
fn test_corrupt_sealed_frame_fails_open() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    for k in 0..100 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.commit().unwrap();
    drop(db);

    let wal = wal_path(&path);
    let mut bytes = std::fs::read(&wal).unwrap();
    // Flip a byte in the first frame's payload, well inside the first
    // sealed group.
    bytes[12 + 100] ^= 0xFF;
    std::fs::write(&wal, bytes).unwrap();

    assert!(matches!(
        CannonDb::open(&path, config),
        Err(CannonError::CorruptWal(_))
    ));
}

/// Random mixed workload, committed, survives a crash-and-reopen with the
/// exact logical contents.
#[test]
fn test_random_workload_reopen_equivalence() {
    let (_dir, path) = scratch();
    let config = DbConfig {
        auto_commit: false,
        ..Default::default()
    };
    let db = CannonDb::open(&path, config.clone()).unwrap();
    let mut rng = rand::thread_rng();
    let mut mirror: BTreeMap<i64, i64> = BTreeMap::new();

    for _ in 0..5000 {
        let k = rng.gen_range(0..600);
        if rng.gen_bool(0.65) {
            let v = rng.gen_range(0..1_000_000);
            db.insert(Value::Int(k), Value::Int(v), true).unwrap();
            mirror.insert(k, v);
        } else {
            match db.remove(&Value::Int(k)) {
                Ok(()) => {
                    assert!(mirror.remove(&k).is_some());
                }
                Err(CannonError::NotFound) => assert!(!mirror.contains_key(&k)),
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }
    db.commit().unwrap();
    db.check_integrity().unwrap();
    drop(db); // crash

    let db = CannonDb::open(&path, config).unwrap();
    let items = db.items().unwrap();
    assert_eq!(items.len(), mirror.len());
    for ((key, value), (k, v)) in items.iter().zip(mirror.iter()) {
        assert_eq!(key, &Value::Int(*k));
        assert_eq!(value, &Value::Int(*v));
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
}

/// Close checkpoints the log; a clean reopen finds an empty WAL and needs
/// no recovery.
#[test]
fn test_clean_close_leaves_empty_wal() {
    let (_dir, path) = scratch();
    let db = CannonDb::open(&path, DbConfig::default()).unwrap();
    for k in 0..50 {
        db.insert(Value::Int(k), Value::Int(k), false).unwrap();
    }
    db.close().unwrap();

    assert_eq!(std::fs::metadata(wal_path(&path)).unwrap().len(), 0);

    let db = CannonDb::open(&path, DbConfig::default()).unwrap();
    assert_eq!(db.len().unwrap(), 50);
    db.close().unwrap();
}
