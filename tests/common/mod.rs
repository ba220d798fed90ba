#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::process::Command;
use std::sync::Mutex;

use tempfile::TempDir;

use capsule::bead::{BeadInfo, BeadType};
use capsule::campaign::{ConflictResolver, TaskLifecycle, TaskPipeline};
use capsule::cap_error::CapError;
use capsule::config::{finalize, CapsuleConfig, ConfigLayer};
use capsule::pipeline::{PhaseResult, PipelineInput, PipelineOutput, PipelineStatus};
use capsule::signal::{Finding, Signal, SignalStatus};

// --- Signal builders ---

pub fn pass_signal(summary: &str) -> Signal {
    Signal {
        status: SignalStatus::Pass,
        feedback: String::new(),
        summary: summary.to_string(),
        files_changed: Vec::new(),
        findings: Vec::new(),
    }
}

pub fn needs_work_signal(feedback: &str) -> Signal {
    Signal {
        status: SignalStatus::NeedsWork,
        feedback: feedback.to_string(),
        summary: "needs work".to_string(),
        files_changed: Vec::new(),
        findings: Vec::new(),
    }
}

pub fn error_signal(feedback: &str) -> Signal {
    Signal {
        status: SignalStatus::Error,
        feedback: feedback.to_string(),
        summary: "error".to_string(),
        files_changed: Vec::new(),
        findings: Vec::new(),
    }
}

/// Six PASS signals -- one per default phase.
pub fn happy_path_signals() -> Vec<Signal> {
    vec![
        pass_signal("tests written"),
        pass_signal("tests approved"),
        pass_signal("implemented"),
        pass_signal("implementation approved"),
        pass_signal("signed off"),
        pass_signal("branch ready"),
    ]
}

// --- Config ---

/// Built-in defaults, checkpointing off (tests enable it explicitly).
pub fn test_config() -> CapsuleConfig {
    let mut config = finalize(ConfigLayer::default()).expect("default config");
    config.pipeline.checkpoint = false;
    config
}

// --- Bead builders ---

pub fn make_bead(id: &str, title: &str, issue_type: BeadType) -> BeadInfo {
    BeadInfo {
        id: id.to_string(),
        title: title.to_string(),
        issue_type,
        ..Default::default()
    }
}

pub fn make_task(id: &str) -> BeadInfo {
    make_bead(id, &format!("Task {}", id), BeadType::Task)
}

// --- Git fixtures ---

/// Create a temporary git repository with an initial commit on `main`.
pub fn setup_temp_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");

    run_git_in(&dir, &["init", "-b", "main"]);
    run_git_in(&dir, &["config", "user.email", "test@test.com"]);
    run_git_in(&dir, &["config", "user.name", "Test"]);

    fs::write(dir.path().join("README.md"), "# Test\n").expect("Failed to write README");
    fs::write(dir.path().join(".gitignore"), ".capsule/\n").expect("Failed to write .gitignore");
    run_git_in(&dir, &["add", "README.md", ".gitignore"]);
    run_git_in(&dir, &["commit", "-m", "Initial commit"]);

    dir
}

pub fn run_git_in(dir: &TempDir, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir.path())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run git {:?}: {}", args, e));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

// --- Pipeline output builders ---

pub fn completed_output(summary: &str) -> PipelineOutput {
    PipelineOutput {
        completed: true,
        phase_results: vec![PhaseResult {
            phase_name: "merge".to_string(),
            attempt: 1,
            signal: pass_signal(summary),
            started_at: "2026-02-10T00:00:00+00:00".to_string(),
            duration_ms: 5,
            provider_used: "claude".to_string(),
        }],
        final_status: PipelineStatus::Completed,
        failure: None,
    }
}

pub fn completed_output_with_findings(findings: Vec<Finding>) -> PipelineOutput {
    let mut output = completed_output("done");
    output.phase_results[0].signal.findings = findings;
    output
}

pub fn failed_output(reason: &str) -> PipelineOutput {
    PipelineOutput {
        completed: false,
        phase_results: Vec::new(),
        final_status: PipelineStatus::Failed,
        failure: Some(reason.to_string()),
    }
}

pub fn paused_output() -> PipelineOutput {
    PipelineOutput {
        completed: false,
        phase_results: Vec::new(),
        final_status: PipelineStatus::Paused,
        failure: None,
    }
}

// --- Campaign seam mocks ---

/// Scripted task pipeline: pops the next output for each bead ID, records
/// invocation order and inputs.
pub struct MockTaskPipeline {
    outputs: Mutex<HashMap<String, Vec<PipelineOutput>>>,
    runs: Mutex<Vec<PipelineInput>>,
    validations: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockTaskPipeline {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
            validations: Mutex::new(Vec::new()),
        }
    }

    /// Queue an output for a bead (first queued, first returned).
    pub fn with_output(self, bead_id: &str, output: PipelineOutput) -> Self {
        {
            let mut outputs = self.outputs.lock().expect("outputs lock");
            outputs.entry(bead_id.to_string()).or_default().push(output);
        }
        self
    }

    pub fn run_order(&self) -> Vec<String> {
        self.runs
            .lock()
            .expect("runs lock")
            .iter()
            .map(|i| i.bead_id.clone())
            .collect()
    }

    pub fn runs(&self) -> Vec<PipelineInput> {
        self.runs.lock().expect("runs lock").clone()
    }

    pub fn validations(&self) -> Vec<(String, Vec<String>)> {
        self.validations.lock().expect("validations lock").clone()
    }
}

impl TaskPipeline for MockTaskPipeline {
    async fn run_task(&self, input: &PipelineInput) -> Result<PipelineOutput, CapError> {
        self.runs.lock().expect("runs lock").push(input.clone());
        let mut outputs = self.outputs.lock().expect("outputs lock");
        let queue = outputs
            .get_mut(&input.bead_id)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                CapError::Io(format!("MockTaskPipeline: no output for {}", input.bead_id))
            })?;
        Ok(queue.remove(0))
    }

    async fn run_validation(
        &self,
        parent_id: &str,
        phases: &[String],
    ) -> Result<PipelineOutput, CapError> {
        self.validations
            .lock()
            .expect("validations lock")
            .push((parent_id.to_string(), phases.to_vec()));
        Ok(completed_output("validation"))
    }
}

/// Scripted post-task hook: pops results in order, records calls.
pub struct MockLifecycle {
    results: Mutex<Vec<Result<(), CapError>>>,
    calls: Mutex<Vec<String>>,
}

impl MockLifecycle {
    /// A hook that always succeeds.
    pub fn succeeding() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue results for successive calls; once drained, calls succeed.
    pub fn with_results(results: Vec<Result<(), CapError>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: Mutex::new(reversed),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl TaskLifecycle for MockLifecycle {
    async fn after_task(&self, bead_id: &str, _title: &str) -> Result<(), CapError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(bead_id.to_string());
        self.results
            .lock()
            .expect("results lock")
            .pop()
            .unwrap_or(Ok(()))
    }
}

/// Conflict resolver that always reports success and records calls.
pub struct MockResolver {
    calls: Mutex<Vec<String>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ConflictResolver for MockResolver {
    fn resolve(&self, bead_id: &str) -> impl Future<Output = Result<(), CapError>> + Send {
        self.calls
            .lock()
            .expect("calls lock")
            .push(bead_id.to_string());
        std::future::ready(Ok(()))
    }
}
