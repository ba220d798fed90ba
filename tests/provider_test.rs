use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use capsule::provider::{run_subprocess_completion, CANCELLED};
use capsule::signal::SignalStatus;

fn bash(script: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg("-c").arg(script);
    cmd
}

const SIGNAL_LINE: &str =
    r#"{"status":"PASS","feedback":"ok","summary":"done","files_changed":["src/a.rs"]}"#;

#[tokio::test]
async fn captures_stdout_and_extracts_the_signal() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("logs/phase.log");
    let cancel = CancellationToken::new();

    let script = format!("echo 'working on it...'; echo '{}'", SIGNAL_LINE);
    let output =
        run_subprocess_completion(bash(&script), &log_path, Duration::from_secs(10), &cancel)
            .await
            .expect("run");

    assert_eq!(output.signal.status, SignalStatus::Pass);
    assert_eq!(output.signal.files_changed, vec!["src/a.rs"]);
    assert!(output.raw_output.contains("working on it..."));

    // The full stdout streamed to the per-phase log file.
    let log = std::fs::read_to_string(&log_path).expect("log file");
    assert!(log.contains("working on it..."));
    assert!(log.contains("\"status\":\"PASS\""));
}

#[tokio::test]
async fn non_zero_exit_still_derives_signal_from_stdout() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    let script = format!("echo '{}'; exit 3", SIGNAL_LINE);
    let output =
        run_subprocess_completion(bash(&script), &log_path, Duration::from_secs(10), &cancel)
            .await
            .expect("run");

    assert_eq!(output.signal.status, SignalStatus::Pass);
}

#[tokio::test]
async fn missing_signal_synthesizes_error() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    let output = run_subprocess_completion(
        bash("echo 'just prose, no signal'"),
        &log_path,
        Duration::from_secs(10),
        &cancel,
    )
    .await
    .expect("run");

    assert_eq!(output.signal.status, SignalStatus::Error);
    assert_eq!(output.signal.feedback, "no valid signal in process output");
}

#[tokio::test]
async fn stderr_reaches_the_log_but_not_the_signal_scan() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    // The signal-shaped line on stderr must not count.
    let script = format!("echo '{}' >&2; echo 'plain stdout'", SIGNAL_LINE);
    let output =
        run_subprocess_completion(bash(&script), &log_path, Duration::from_secs(10), &cancel)
            .await
            .expect("run");

    assert_eq!(output.signal.status, SignalStatus::Error);

    let log = std::fs::read_to_string(&log_path).expect("log file");
    assert!(log.contains("--- stderr ---"));
    assert!(log.contains("\"status\":\"PASS\""));
}

#[tokio::test]
async fn timeout_kills_the_subprocess() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    let started = std::time::Instant::now();
    let result =
        run_subprocess_completion(bash("sleep 30"), &log_path, Duration::from_secs(1), &cancel)
            .await;

    let err = result.unwrap_err();
    assert!(err.contains("timed out"), "got: {}", err);
    // SIGTERM lands long before the sleep would finish.
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn cancellation_tears_the_subprocess_down() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = run_subprocess_completion(
        bash("sleep 30"),
        &log_path,
        Duration::from_secs(60),
        &cancel,
    )
    .await
    .unwrap_err();

    assert_eq!(err, CANCELLED);
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn spawn_failure_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("phase.log");
    let cancel = CancellationToken::new();

    let cmd = tokio::process::Command::new("capsule-no-such-binary-on-path");
    let err = run_subprocess_completion(cmd, &log_path, Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(err.contains("spawn"), "got: {}", err);
}
