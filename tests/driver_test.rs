mod common;

use std::fs;
use std::process::Command;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use capsule::bead::{BeadType, MockBeadTracker};
use capsule::campaign::TaskPipeline;
use capsule::cap_error::CapError;
use capsule::config::CapsuleConfig;
use capsule::driver::BeadPipelineDriver;
use capsule::lifecycle::post_task;
use capsule::pipeline::{default_phases, PipelineInput, PipelineStatus};
use capsule::provider::MockCompletionRunner;
use capsule::workspace::WorkspaceManager;

use common::{
    error_signal, happy_path_signals, make_bead, pass_signal, run_git_in, setup_temp_repo,
    test_config,
};

const BEAD: &str = "demo-001.1.1";

struct Rig {
    repo: TempDir,
    config: CapsuleConfig,
    tracker: MockBeadTracker,
}

impl Rig {
    fn new() -> Self {
        let repo = setup_temp_repo();
        let mut bead = make_bead(BEAD, "Reject empty input", BeadType::Task);
        bead.acceptance_criteria = "- empty input rejected".to_string();
        Self {
            repo,
            config: test_config(),
            tracker: MockBeadTracker::new().with_bead(bead),
        }
    }

    fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(
            self.repo.path(),
            &self.repo.path().join(".capsule/worktrees"),
        )
    }

    async fn run_task(&self, runner: &MockCompletionRunner) -> Result<PipelineStatus, CapError> {
        let phases = default_phases();
        let workspaces = self.workspaces();
        let cancel = CancellationToken::new();
        let driver = BeadPipelineDriver {
            config: &self.config,
            phases: &phases,
            runner,
            tracker: &self.tracker,
            workspaces: &workspaces,
            project_root: self.repo.path(),
            base_path: self.repo.path().join(".capsule"),
            cancel: &cancel,
        };

        let input = PipelineInput {
            bead_id: BEAD.to_string(),
            ..Default::default()
        };
        driver.run_task(&input).await.map(|o| o.final_status)
    }

    /// Stand in for the execute phase: commit a file on the bead's branch.
    fn commit_in_workspace(&self, file: &str, contents: &str) {
        let ws = self.repo.path().join(".capsule/worktrees").join(BEAD);
        fs::write(ws.join(file), contents).expect("write");
        Command::new("git")
            .args(["add", file])
            .current_dir(&ws)
            .output()
            .expect("add");
        Command::new("git")
            .args(["commit", "-m", &format!("{}: add {}", BEAD, file)])
            .current_dir(&ws)
            .output()
            .expect("commit");
    }
}

// --- Single-bead happy path (workspace in, merge out) ---

#[tokio::test]
async fn happy_path_creates_workspace_runs_phases_and_merges() {
    let rig = Rig::new();
    let runner = MockCompletionRunner::from_signals(happy_path_signals());

    let status = rig.run_task(&runner).await.expect("run");
    assert_eq!(status, PipelineStatus::Completed);

    // Workspace exists with the mission briefing appended per phase.
    let ws = rig.repo.path().join(".capsule/worktrees").join(BEAD);
    let worklog = fs::read_to_string(ws.join("worklog.md")).expect("worklog");
    assert!(worklog.contains("Reject empty input"));
    assert!(worklog.contains("test-writer"));
    assert!(worklog.contains("merge"));

    // Per-phase subprocess logs stream under {base}/logs/{id}.
    // (The mock runner never writes them; the directory layout is owned by
    // the real runner, so only the worklog is asserted here.)

    rig.commit_in_workspace("feature.txt", "the change\n");

    let report = post_task(
        &rig.workspaces(),
        &rig.tracker,
        BEAD,
        "Reject empty input",
        &rig.repo.path().join(".capsule/logs"),
    )
    .await
    .expect("post_task");

    assert!(report.merged);
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

    // Workspace and branch are gone; the merge landed on main.
    assert!(!ws.exists());
    let branches = run_git_in(&rig.repo, &["branch", "--list", "capsule-*"]);
    assert!(branches.trim().is_empty(), "left branches: {}", branches);
    assert!(rig.repo.path().join("feature.txt").exists());
    let log = run_git_in(&rig.repo, &["log", "--oneline", "-1"]);
    assert!(
        log.contains("demo-001.1.1: Reject empty input"),
        "got: {}",
        log
    );

    // The worklog was archived and the bead closed.
    let archived = rig
        .repo
        .path()
        .join(".capsule/logs")
        .join(BEAD)
        .join("worklog.md");
    assert!(archived.exists());
    assert!(rig.tracker.closed_beads().contains(&BEAD.to_string()));
}

// --- Failure preserves the workspace ---

#[tokio::test]
async fn failed_pipeline_preserves_workspace_and_branch() {
    let rig = Rig::new();
    let runner = MockCompletionRunner::from_signals(vec![
        pass_signal("w1"),
        error_signal("review crashed"),
    ]);

    let status = rig.run_task(&runner).await.expect("run");
    assert_eq!(status, PipelineStatus::Failed);

    let ws = rig.repo.path().join(".capsule/worktrees").join(BEAD);
    assert!(ws.exists());
    let branches = run_git_in(&rig.repo, &["branch", "--list", "capsule-*"]);
    assert!(branches.contains("capsule-demo-001.1.1"), "got: {}", branches);
}

// --- Concurrent-run guard ---

#[tokio::test]
async fn second_run_for_same_bead_is_already_exists() {
    let rig = Rig::new();
    let runner = MockCompletionRunner::from_signals(vec![
        pass_signal("w1"),
        error_signal("crashed"),
    ]);
    rig.run_task(&runner).await.expect("first run");

    // Checkpointing is off, so the surviving workspace marks a conflicting
    // concurrent (or abandoned) run.
    let second = MockCompletionRunner::from_signals(happy_path_signals());
    let err = rig.run_task(&second).await.unwrap_err();
    assert!(matches!(err, CapError::AlreadyExists(_)), "got: {:?}", err);
}

// --- Checkpoint resume across invocations ---

#[tokio::test]
async fn interrupted_run_resumes_in_the_same_workspace() {
    let mut rig = Rig::new();
    rig.config.pipeline.checkpoint = true;

    let first = MockCompletionRunner::from_signals(vec![
        pass_signal("tests written"),
        pass_signal("tests approved"),
        error_signal("implementation crashed"),
    ]);
    let status = rig.run_task(&first).await.expect("first run");
    assert_eq!(status, PipelineStatus::Failed);

    let second = MockCompletionRunner::from_signals(vec![
        pass_signal("implemented"),
        pass_signal("implementation approved"),
        pass_signal("signed off"),
        pass_signal("branch ready"),
    ]);
    let status = rig.run_task(&second).await.expect("second run");
    assert_eq!(status, PipelineStatus::Completed);

    // The resumed run skipped the test pair entirely.
    let calls = second.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[0].prompt.contains("# Implementation"));
}

// --- Merge conflict surfaces as MergeConflict ---

#[tokio::test]
async fn conflicting_merge_pauses_with_workspace_intact() {
    let rig = Rig::new();
    let runner = MockCompletionRunner::from_signals(happy_path_signals());
    rig.run_task(&runner).await.expect("run");

    rig.commit_in_workspace("README.md", "# Worktree version\n");
    fs::write(rig.repo.path().join("README.md"), "# Main version\n").expect("write main");
    run_git_in(&rig.repo, &["commit", "-am", "main: edit readme"]);

    let err = post_task(
        &rig.workspaces(),
        &rig.tracker,
        BEAD,
        "Reject empty input",
        &rig.repo.path().join(".capsule/logs"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CapError::MergeConflict(_)), "got: {:?}", err);
    // The workspace survives for conflict resolution.
    assert!(rig.repo.path().join(".capsule/worktrees").join(BEAD).exists());
    // Main is clean after the aborted merge.
    let status = run_git_in(&rig.repo, &["status", "--porcelain"]);
    assert!(status.trim().is_empty(), "dirty: {}", status);
}

// --- Invalid IDs are rejected up front ---

#[tokio::test]
async fn invalid_bead_id_is_rejected_before_any_work() {
    let rig = Rig::new();
    let runner = MockCompletionRunner::from_signals(happy_path_signals());
    let phases = default_phases();
    let workspaces = rig.workspaces();
    let cancel = CancellationToken::new();
    let driver = BeadPipelineDriver {
        config: &rig.config,
        phases: &phases,
        runner: &runner,
        tracker: &rig.tracker,
        workspaces: &workspaces,
        project_root: rig.repo.path(),
        base_path: rig.repo.path().join(".capsule"),
        cancel: &cancel,
    };

    let input = PipelineInput {
        bead_id: "../escape".to_string(),
        ..Default::default()
    };
    let err = driver.run_task(&input).await.unwrap_err();
    assert!(matches!(err, CapError::InvalidId(_)));
    assert!(runner.calls().is_empty());
}
