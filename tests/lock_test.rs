use tempfile::TempDir;

use capsule::lock::{self, LockHolder};

#[test]
fn acquire_writes_a_holder_record_and_removes_it_on_drop() {
    let dir = TempDir::new().expect("tempdir");

    let guard = lock::acquire(dir.path(), "run demo-001.1.1").expect("acquire");

    let holder_path = dir.path().join("capsule.holder.json");
    let raw = std::fs::read_to_string(&holder_path).expect("holder record");
    let holder: LockHolder = serde_json::from_str(&raw).expect("parse holder");
    assert_eq!(holder.pid, std::process::id() as i32);
    assert_eq!(holder.task, "run demo-001.1.1");
    assert!(!holder.started_at.is_empty());

    drop(guard);
    assert!(!holder_path.exists());
}

#[test]
fn reacquire_after_release_succeeds() {
    let dir = TempDir::new().expect("tempdir");

    let first = lock::acquire(dir.path(), "campaign epic-1").expect("first");
    drop(first);
    let second = lock::acquire(dir.path(), "campaign epic-1").expect("second");
    drop(second);
}

#[test]
fn creates_the_runtime_directory() {
    let dir = TempDir::new().expect("tempdir");
    let nested = dir.path().join("deep/.capsule");

    let guard = lock::acquire(&nested, "run t-1").expect("acquire");
    assert!(nested.join("capsule.lock").exists());
    drop(guard);
}
