//! E2E Test: Aborted deltas on the file backend
//!
//! A delta whose commit fails must leave the agent directory exactly as the
//! last commit left it: no staging files, no stray delta, same sequence record.

use std::fs;
use std::path::Path;

use strata_core::storage::FileStore;
use strata_core::{
    DeltaController, DeltaStore, Envelope, Epoch, ManagedObject, PersistenceConfig,
    PersistenceError, Value,
};
use tempfile::TempDir;

/// Regular files in `dir`, sorted by name
fn files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().unwrap().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn rehydrated_x(root: &Path) -> Option<Value> {
    let store = FileStore::open(root, "agent-1").unwrap();
    let ctl = DeltaController::new("agent-1", store, PersistenceConfig::default());
    let mut live = Envelope::new();
    ctl.rehydrate(&mut live).unwrap().unwrap();
    let object = live.objects().next().cloned().unwrap();
    object.get("x")
}

/// E2E test: A failed commit leaves no file behind and the sequence record untouched
#[test]
fn e2e_file_store_abort_leaves_directory_unchanged() {
    let tmp = TempDir::new().unwrap();
    let store = FileStore::open(tmp.path(), "agent-1").unwrap();
    let dir = store.dir().to_path_buf();
    let ctl = DeltaController::new("agent-1", store.clone(), PersistenceConfig::default());

    let a = ManagedObject::builder("a").field("x", 1).build();
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_add(&a)))
        .unwrap();
    let sequence_before = fs::read(dir.join("sequence.json")).unwrap();
    assert_eq!(files(&dir), vec!["delta_00000000", "sequence.json"]);

    // A directory where delta 1 must land makes its commit fail.
    let blocker = dir.join("delta_00000001");
    fs::create_dir(&blocker).unwrap();

    a.set("x", 2);
    let err = ctl
        .persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::TransactionAborted { delta: 1, .. }));

    assert_eq!(files(&dir), vec!["delta_00000000", "sequence.json"]);
    assert_eq!(fs::read(dir.join("sequence.json")).unwrap(), sequence_before);
    assert_eq!(store.list_deltas().unwrap(), vec![0]);
    assert_eq!(rehydrated_x(tmp.path()), Some(Value::Int(1)));

    // With the obstacle gone the same delta number is retried.
    fs::remove_dir(&blocker).unwrap();
    let outcome = ctl.persist(Epoch::new()).unwrap();
    assert_eq!(outcome.delta, 1);
    assert_eq!(
        files(&dir),
        vec!["delta_00000000", "delta_00000001", "sequence.json"]
    );
    assert_eq!(rehydrated_x(tmp.path()), Some(Value::Int(2)));
}
