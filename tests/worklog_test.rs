mod common;

use std::fs;

use tempfile::TempDir;

use capsule::bead::BeadContext;
use capsule::cap_error::CapError;
use capsule::worklog::{append_entry, archive, instantiate, WORKLOG_NAME};

use common::{needs_work_signal, pass_signal};

fn demo_context() -> BeadContext {
    BeadContext {
        task_id: "t-1".to_string(),
        task_title: "Add parser".to_string(),
        task_description: "Parse the things.".to_string(),
        acceptance_criteria: "- parses valid input".to_string(),
        ..Default::default()
    }
}

#[test]
fn instantiate_interpolates_the_template() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");

    let path = instantiate(dir.path(), &workspace, &demo_context()).expect("instantiate");

    let contents = fs::read_to_string(&path).expect("read");
    assert!(contents.contains("t-1"));
    assert!(contents.contains("Add parser"));
    assert!(contents.contains("- parses valid input"));
    assert!(!contents.contains("{{."));
}

#[test]
fn instantiate_preserves_an_existing_worklog() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");

    fs::write(workspace.join(WORKLOG_NAME), "existing history\n").expect("write");
    instantiate(dir.path(), &workspace, &demo_context()).expect("instantiate");

    let contents = fs::read_to_string(workspace.join(WORKLOG_NAME)).expect("read");
    assert_eq!(contents, "existing history\n");
}

#[test]
fn local_template_overlay_wins() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");
    fs::create_dir_all(dir.path().join("templates")).expect("mkdir templates");
    fs::write(
        dir.path().join("templates/worklog.md.template"),
        "# Custom briefing for {{.BeadID}}\n",
    )
    .expect("write template");

    instantiate(dir.path(), &workspace, &demo_context()).expect("instantiate");

    let contents = fs::read_to_string(workspace.join(WORKLOG_NAME)).expect("read");
    assert_eq!(contents, "# Custom briefing for t-1\n");
}

#[test]
fn append_entry_records_phase_outcomes_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");
    instantiate(dir.path(), &workspace, &demo_context()).expect("instantiate");

    append_entry(&workspace, "test-writer", 1, &pass_signal("tests written")).expect("append");
    append_entry(&workspace, "test-review", 1, &needs_work_signal("gap")).expect("append");

    let contents = fs::read_to_string(workspace.join(WORKLOG_NAME)).expect("read");
    let writer_pos = contents.find("test-writer (attempt 1)").expect("writer entry");
    let review_pos = contents.find("test-review (attempt 1)").expect("review entry");
    assert!(writer_pos < review_pos);
    assert!(contents.contains("**Status:** PASS"));
    assert!(contents.contains("**Status:** NEEDS_WORK"));
    assert!(contents.contains("**Summary:** tests written"));
}

#[test]
fn archive_copies_the_worklog_to_the_logs_dir() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");
    instantiate(dir.path(), &workspace, &demo_context()).expect("instantiate");
    append_entry(&workspace, "merge", 1, &pass_signal("landed")).expect("append");

    let logs_dir = dir.path().join("logs").join("t-1");
    let archived = archive(&workspace, &logs_dir).expect("archive");

    assert_eq!(archived, logs_dir.join(WORKLOG_NAME));
    let contents = fs::read_to_string(&archived).expect("read");
    assert!(contents.contains("**Summary:** landed"));
}

#[test]
fn archive_without_worklog_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let workspace = dir.path().join("ws");
    fs::create_dir_all(&workspace).expect("mkdir");

    let err = archive(&workspace, &dir.path().join("logs/t-1")).unwrap_err();
    assert!(matches!(err, CapError::NotFound(_)));
}
