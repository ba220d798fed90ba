use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::bead::BeadContext;
use crate::cap_error::CapError;
use crate::config::CapsuleConfig;
use crate::prompt::{self, SiblingSummary};
use crate::provider::CompletionRunner;
use crate::signal::{Signal, SignalStatus};
use crate::worklog;
use crate::{log_info, log_warn};

// --- Phase definitions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRole {
    Writer,
    Reviewer,
    Terminal,
}

/// A node in the pipeline graph. The six-phase default is fixed but
/// data-driven: the state machine is expressible as this table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseDefinition {
    pub name: String,
    pub role: PhaseRole,
    /// For a reviewer: the writer it reviews. The reviewer must directly
    /// follow its writer in the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_with: Option<String>,
    /// Back-edge target for a standalone reviewer (sign-off -> execute).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_after: Option<u32>,
}

impl PhaseDefinition {
    pub fn new(name: &str, role: PhaseRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            paired_with: None,
            retry_target: None,
            max_attempts: None,
            timeout_secs: None,
            provider: None,
            escalate_provider: None,
            escalate_after: None,
        }
    }
}

/// The default six-phase pipeline:
///
/// ```text
/// test-writer <-> test-review -> execute <-> execute-review -> sign-off -> merge
/// ```
///
/// Sign-off's NEEDS_WORK back-edge targets `execute` (the single writer,
/// not the pair): sign-off has the broadest view, and an implementation
/// that still fails after a targeted sign-off nudge is out of the system's
/// ability to fix.
pub fn default_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new("test-writer", PhaseRole::Writer),
        PhaseDefinition {
            paired_with: Some("test-writer".to_string()),
            ..PhaseDefinition::new("test-review", PhaseRole::Reviewer)
        },
        PhaseDefinition::new("execute", PhaseRole::Writer),
        PhaseDefinition {
            paired_with: Some("execute".to_string()),
            ..PhaseDefinition::new("execute-review", PhaseRole::Reviewer)
        },
        PhaseDefinition {
            retry_target: Some("execute".to_string()),
            ..PhaseDefinition::new("sign-off", PhaseRole::Reviewer)
        },
        PhaseDefinition::new("merge", PhaseRole::Terminal),
    ]
}

/// Load the configured phase table: `"default"` or a path to a TOML file
/// with a `[[phases]]` array.
pub fn load_phases(
    config: &CapsuleConfig,
    project_root: &Path,
) -> Result<Vec<PhaseDefinition>, CapError> {
    let phases = if config.pipeline.phases == "default" {
        default_phases()
    } else {
        let path = project_root.join(&config.pipeline.phases);
        let contents = fs::read_to_string(&path)
            .map_err(|e| CapError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        #[derive(Deserialize)]
        struct PhaseFile {
            phases: Vec<PhaseDefinition>,
        }
        let file: PhaseFile = toml::from_str(&contents)
            .map_err(|e| CapError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        file.phases
    };

    validate_phases(&phases).map_err(CapError::Config)?;
    Ok(phases)
}

/// Validate a phase table's shape. Returns the first joined error list.
pub fn validate_phases(phases: &[PhaseDefinition]) -> Result<(), String> {
    let mut errors = Vec::new();

    if phases.is_empty() {
        errors.push("phase table must not be empty".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for phase in phases {
        if !seen.insert(&phase.name) {
            errors.push(format!("duplicate phase name '{}'", phase.name));
        }
    }

    for (idx, phase) in phases.iter().enumerate() {
        if let Some(ref paired) = phase.paired_with {
            if phase.role != PhaseRole::Reviewer {
                errors.push(format!(
                    "phase '{}': paired_with is only valid on reviewers",
                    phase.name
                ));
            }
            let precedes = idx > 0
                && phases[idx - 1].name == *paired
                && phases[idx - 1].role == PhaseRole::Writer;
            if !precedes {
                errors.push(format!(
                    "phase '{}': paired_with '{}' must name the immediately preceding writer",
                    phase.name, paired
                ));
            }
        }

        if let Some(ref target) = phase.retry_target {
            let earlier_writer = phases[..idx]
                .iter()
                .any(|p| p.name == *target && p.role == PhaseRole::Writer);
            if !earlier_writer {
                errors.push(format!(
                    "phase '{}': retry_target '{}' must name an earlier writer",
                    phase.name, target
                ));
            }
            if phase.paired_with.is_some() {
                errors.push(format!(
                    "phase '{}': retry_target and paired_with are mutually exclusive",
                    phase.name
                ));
            }
        }

        if phase.role == PhaseRole::Terminal
            && (phase.paired_with.is_some() || phase.retry_target.is_some())
        {
            errors.push(format!(
                "phase '{}': terminal phases take no pairing or back-edge",
                phase.name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

// --- Stage derivation ---

/// One execution unit of the state machine, derived from the phase table.
#[derive(Debug)]
enum Stage<'a> {
    /// Writer/reviewer pair with feedback-propagating retries.
    Pair {
        writer: &'a PhaseDefinition,
        reviewer: &'a PhaseDefinition,
    },
    /// Standalone reviewer with a back-edge to an earlier writer.
    Gate {
        phase: &'a PhaseDefinition,
        retry_target: &'a PhaseDefinition,
    },
    /// A single phase run once: unpaired writers and terminals.
    Single { phase: &'a PhaseDefinition },
}

impl Stage<'_> {
    /// The phase whose PASS completes this stage.
    fn final_phase_name(&self) -> &str {
        match self {
            Stage::Pair { reviewer, .. } => &reviewer.name,
            Stage::Gate { phase, .. } => &phase.name,
            Stage::Single { phase } => &phase.name,
        }
    }

    fn contains(&self, phase_name: &str) -> bool {
        match self {
            Stage::Pair { writer, reviewer } => {
                writer.name == phase_name || reviewer.name == phase_name
            }
            Stage::Gate {
                phase,
                retry_target,
            } => phase.name == phase_name || retry_target.name == phase_name,
            Stage::Single { phase } => phase.name == phase_name,
        }
    }
}

fn build_stages(phases: &[PhaseDefinition]) -> Result<Vec<Stage<'_>>, CapError> {
    let mut stages = Vec::new();
    let mut idx = 0;

    while idx < phases.len() {
        let phase = &phases[idx];
        match phase.role {
            PhaseRole::Writer => {
                // A reviewer directly after that names this writer forms a pair.
                let paired = phases.get(idx + 1).filter(|next| {
                    next.role == PhaseRole::Reviewer
                        && next.paired_with.as_deref() == Some(phase.name.as_str())
                });
                match paired {
                    Some(reviewer) => {
                        stages.push(Stage::Pair {
                            writer: phase,
                            reviewer,
                        });
                        idx += 2;
                    }
                    None => {
                        stages.push(Stage::Single { phase });
                        idx += 1;
                    }
                }
            }
            PhaseRole::Reviewer => {
                match phase.retry_target.as_deref() {
                    Some(target) => {
                        let retry_target = phases
                            .iter()
                            .find(|p| p.name == target)
                            .ok_or_else(|| {
                                CapError::Config(format!(
                                    "phase '{}': unknown retry_target '{}'",
                                    phase.name, target
                                ))
                            })?;
                        stages.push(Stage::Gate {
                            phase,
                            retry_target,
                        });
                    }
                    None => stages.push(Stage::Single { phase }),
                }
                idx += 1;
            }
            PhaseRole::Terminal => {
                stages.push(Stage::Single { phase });
                idx += 1;
            }
        }
    }

    Ok(stages)
}

// --- Results ---

/// One executed phase attempt's outcome. List order equals execution order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseResult {
    pub phase_name: String,
    pub attempt: u32,
    pub signal: Signal,
    pub started_at: String,
    pub duration_ms: u64,
    pub provider_used: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Paused,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    pub completed: bool,
    pub phase_results: Vec<PhaseResult>,
    pub final_status: PipelineStatus,
    /// Why the pipeline failed, when `final_status` is `Failed`.
    pub failure: Option<String>,
}

/// Inputs for a single pipeline invocation at the campaign boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineInput {
    pub bead_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub sibling_context: Vec<SiblingSummary>,
}

impl PipelineInput {
    /// Fold the input's overrides into a resolved bead context.
    pub fn apply_to(&self, mut ctx: BeadContext) -> BeadContext {
        if let Some(ref title) = self.title {
            if ctx.task_title.is_empty() {
                ctx.task_title = title.clone();
            }
        }
        if let Some(ref description) = self.description {
            if ctx.task_description.is_empty() {
                ctx.task_description = description.clone();
            }
        }
        ctx
    }
}

// --- Checkpoints ---

/// Snapshot written after each phase execution when checkpointing is on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub bead_id: String,
    pub phase_name: String,
    pub attempt: u32,
    pub last_signal: Signal,
    pub timestamp: String,
}

pub fn checkpoint_path(checkpoint_dir: &Path, bead_id: &str) -> PathBuf {
    checkpoint_dir.join(format!("{}.json", bead_id))
}

pub fn save_checkpoint(checkpoint_dir: &Path, checkpoint: &Checkpoint) -> Result<(), CapError> {
    fs::create_dir_all(checkpoint_dir)
        .map_err(|e| CapError::Io(format!("Failed to create {}: {}", checkpoint_dir.display(), e)))?;

    let json = serde_json::to_string_pretty(checkpoint)
        .map_err(|e| CapError::Io(format!("Failed to serialize checkpoint: {}", e)))?;

    let temp_file = NamedTempFile::new_in(checkpoint_dir)
        .map_err(|e| CapError::Io(format!("Failed to create temp file: {}", e)))?;
    fs::write(temp_file.path(), &json)
        .map_err(|e| CapError::Io(format!("Failed to write temp file: {}", e)))?;

    let path = checkpoint_path(checkpoint_dir, &checkpoint.bead_id);
    temp_file
        .persist(&path)
        .map_err(|e| CapError::Io(format!("Failed to rename temp file to {}: {}", path.display(), e)))?;

    Ok(())
}

pub fn load_checkpoint(checkpoint_dir: &Path, bead_id: &str) -> Result<Option<Checkpoint>, CapError> {
    let path = checkpoint_path(checkpoint_dir, bead_id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CapError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let checkpoint = serde_json::from_str(&contents)
        .map_err(|e| CapError::Io(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(checkpoint))
}

pub fn remove_checkpoint(checkpoint_dir: &Path, bead_id: &str) {
    let path = checkpoint_path(checkpoint_dir, bead_id);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log_warn!("Warning: failed to remove checkpoint {}: {}", path.display(), e);
        }
    }
}

/// Index of the stage to resume from, given the last checkpoint.
///
/// The stage of the checkpointed phase is re-entered unless that phase
/// completed its stage with a PASS, in which case the next stage runs.
fn resume_stage_index(stages: &[Stage<'_>], checkpoint: &Checkpoint) -> usize {
    for (idx, stage) in stages.iter().enumerate() {
        if stage.contains(&checkpoint.phase_name) {
            let stage_done = checkpoint.last_signal.status == SignalStatus::Pass
                && stage.final_phase_name() == checkpoint.phase_name;
            return if stage_done { idx + 1 } else { idx };
        }
    }
    0
}

// --- Orchestrator ---

/// Outcome of one stage: advance, abort the pipeline, or pause.
enum StageOutcome {
    Advance,
    Abort(String),
    Paused,
}

/// Outcome of one phase call.
enum PhaseCall {
    Done(PhaseResult),
    Cancelled,
}

/// Drives the fixed phase state machine for one bead.
///
/// Phases run strictly in order; the completion subprocess is the only
/// long-latency operation. All I/O failures around the run (worklog,
/// checkpoints) warn and continue -- only phase outcomes decide the
/// pipeline's fate.
pub struct PipelineRunner<'a, R: CompletionRunner> {
    pub config: &'a CapsuleConfig,
    pub phases: &'a [PhaseDefinition],
    pub runner: &'a R,
    /// Repository root, for prompt template overlays.
    pub project_root: &'a Path,
    /// Where phase subprocesses run: the bead's workspace, or the main
    /// line for validation pipelines.
    pub workdir: PathBuf,
    /// Per-bead log directory (`{base}/logs/{id}`).
    pub logs_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub cancel: &'a CancellationToken,
    /// Disabled for validation pipelines, which run outside a workspace.
    pub write_worklog: bool,
}

impl<R: CompletionRunner> PipelineRunner<'_, R> {
    pub async fn run(&self, ctx: &BeadContext, siblings: &[SiblingSummary]) -> PipelineOutput {
        let stages = match build_stages(self.phases) {
            Ok(stages) => stages,
            Err(e) => return self.failed(Vec::new(), e.to_string()),
        };

        let mut results: Vec<PhaseResult> = Vec::new();

        let checkpointing = self.config.pipeline.checkpoint;
        let mut start_stage = 0;
        if checkpointing {
            match load_checkpoint(&self.checkpoint_dir, &ctx.task_id) {
                Ok(Some(checkpoint)) => {
                    start_stage = resume_stage_index(&stages, &checkpoint);
                    log_info!(
                        "[{}] Resuming from checkpoint after '{}' (stage {}/{})",
                        ctx.task_id,
                        checkpoint.phase_name,
                        start_stage + 1,
                        stages.len()
                    );
                }
                Ok(None) => {}
                Err(e) => log_warn!("Warning: failed to load checkpoint: {}", e),
            }
        }

        for stage in stages.iter().skip(start_stage) {
            // Checkpointed boundary: cancellation here pauses rather than
            // failing.
            if self.cancel.is_cancelled() {
                return if checkpointing && !results.is_empty() {
                    self.paused(results)
                } else {
                    self.failed(results, "cancelled".to_string())
                };
            }

            let outcome = match stage {
                Stage::Pair { writer, reviewer } => {
                    self.run_pair(writer, reviewer, ctx, siblings, &mut results)
                        .await
                }
                Stage::Gate {
                    phase,
                    retry_target,
                } => {
                    self.run_gate(phase, retry_target, ctx, siblings, &mut results)
                        .await
                }
                Stage::Single { phase } => {
                    self.run_single(phase, ctx, siblings, &mut results).await
                }
            };

            match outcome {
                StageOutcome::Advance => {}
                StageOutcome::Abort(reason) => return self.failed(results, reason),
                StageOutcome::Paused => return self.paused(results),
            }
        }

        remove_checkpoint(&self.checkpoint_dir, &ctx.task_id);
        PipelineOutput {
            completed: true,
            phase_results: results,
            final_status: PipelineStatus::Completed,
            failure: None,
        }
    }

    /// Writer/reviewer pair with feedback-propagating retries.
    ///
    /// 1. Run writer (with accumulated feedback); non-PASS aborts.
    /// 2. Run reviewer. PASS advances; ERROR aborts; NEEDS_WORK feeds the
    ///    writer's next attempt until `max_attempts` is exhausted.
    async fn run_pair(
        &self,
        writer: &PhaseDefinition,
        reviewer: &PhaseDefinition,
        ctx: &BeadContext,
        siblings: &[SiblingSummary],
        results: &mut Vec<PhaseResult>,
    ) -> StageOutcome {
        let max_attempts = writer
            .max_attempts
            .unwrap_or(self.config.pipeline.retry.max_attempts);
        let mut feedback = String::new();

        for attempt in 1..=max_attempts {
            let provider = self.provider_for(writer, attempt);

            let writer_result = match self
                .run_phase(writer, attempt, &provider, ctx, &feedback, siblings)
                .await
            {
                PhaseCall::Done(result) => result,
                PhaseCall::Cancelled => return self.cancelled_outcome(results),
            };
            let writer_status = writer_result.signal.status;
            results.push(writer_result);

            if writer_status != SignalStatus::Pass {
                return StageOutcome::Abort(format!(
                    "phase '{}' returned {}",
                    writer.name, writer_status
                ));
            }

            // The escalated provider, once engaged, holds for the
            // remainder of the pair.
            let review_provider = self.provider_for(writer, attempt);
            let reviewer_result = match self
                .run_phase(reviewer, attempt, &review_provider, ctx, "", siblings)
                .await
            {
                PhaseCall::Done(result) => result,
                PhaseCall::Cancelled => return self.cancelled_outcome(results),
            };
            let review_signal = reviewer_result.signal.clone();
            results.push(reviewer_result);

            match review_signal.status {
                SignalStatus::Pass => return StageOutcome::Advance,
                SignalStatus::Error => {
                    return StageOutcome::Abort(format!(
                        "phase '{}' returned ERROR: {}",
                        reviewer.name, review_signal.feedback
                    ))
                }
                SignalStatus::NeedsWork => {
                    if attempt == max_attempts {
                        return StageOutcome::Abort(
                            CapError::RetriesExhausted {
                                phase: writer.name.clone(),
                                attempts: max_attempts,
                                feedback: review_signal.feedback.clone(),
                            }
                            .to_string(),
                        );
                    }
                    log_info!(
                        "[{}][{}] NEEDS_WORK (attempt {}/{}): {}",
                        ctx.task_id,
                        reviewer.name,
                        attempt,
                        max_attempts,
                        review_signal.summary
                    );
                    feedback = review_signal.feedback;
                }
            }
        }

        StageOutcome::Abort(format!(
            "phase '{}' retry loop exited unexpectedly",
            writer.name
        ))
    }

    /// Standalone reviewer with a back-edge (sign-off -> execute).
    ///
    /// On NEEDS_WORK the back-edge writer runs once, WITHOUT its reviewer,
    /// carrying the gate's feedback. A non-PASS from that re-executed
    /// writer aborts immediately.
    async fn run_gate(
        &self,
        gate: &PhaseDefinition,
        retry_target: &PhaseDefinition,
        ctx: &BeadContext,
        siblings: &[SiblingSummary],
        results: &mut Vec<PhaseResult>,
    ) -> StageOutcome {
        let max_attempts = gate
            .max_attempts
            .unwrap_or(self.config.pipeline.retry.max_attempts);

        for attempt in 1..=max_attempts {
            let provider = self.provider_for(gate, attempt);
            let gate_result = match self
                .run_phase(gate, attempt, &provider, ctx, "", siblings)
                .await
            {
                PhaseCall::Done(result) => result,
                PhaseCall::Cancelled => return self.cancelled_outcome(results),
            };
            let gate_signal = gate_result.signal.clone();
            results.push(gate_result);

            match gate_signal.status {
                SignalStatus::Pass => return StageOutcome::Advance,
                SignalStatus::Error => {
                    return StageOutcome::Abort(format!(
                        "phase '{}' returned ERROR: {}",
                        gate.name, gate_signal.feedback
                    ))
                }
                SignalStatus::NeedsWork => {
                    if attempt == max_attempts {
                        return StageOutcome::Abort(
                            CapError::RetriesExhausted {
                                phase: gate.name.clone(),
                                attempts: max_attempts,
                                feedback: gate_signal.feedback.clone(),
                            }
                            .to_string(),
                        );
                    }

                    let writer_provider = self.provider_for(retry_target, attempt);
                    let writer_result = match self
                        .run_phase(
                            retry_target,
                            attempt,
                            &writer_provider,
                            ctx,
                            &gate_signal.feedback,
                            siblings,
                        )
                        .await
                    {
                        PhaseCall::Done(result) => result,
                        PhaseCall::Cancelled => return self.cancelled_outcome(results),
                    };
                    let writer_status = writer_result.signal.status;
                    results.push(writer_result);

                    if writer_status != SignalStatus::Pass {
                        return StageOutcome::Abort(format!(
                            "phase '{}' returned {} on the '{}' back-edge",
                            retry_target.name, writer_status, gate.name
                        ));
                    }
                }
            }
        }

        StageOutcome::Abort(format!(
            "phase '{}' retry loop exited unexpectedly",
            gate.name
        ))
    }

    /// A single phase run once. PASS advances; anything else aborts.
    async fn run_single(
        &self,
        phase: &PhaseDefinition,
        ctx: &BeadContext,
        siblings: &[SiblingSummary],
        results: &mut Vec<PhaseResult>,
    ) -> StageOutcome {
        let provider = self.provider_for(phase, 1);
        let result = match self
            .run_phase(phase, 1, &provider, ctx, "", siblings)
            .await
        {
            PhaseCall::Done(result) => result,
            PhaseCall::Cancelled => return self.cancelled_outcome(results),
        };
        let status = result.signal.status;
        let feedback = result.signal.feedback.clone();
        results.push(result);

        match status {
            SignalStatus::Pass => StageOutcome::Advance,
            _ => StageOutcome::Abort(format!(
                "phase '{}' returned {}: {}",
                phase.name, status, feedback
            )),
        }
    }

    /// Execute one phase call: compose the prompt, run the provider,
    /// derive the signal, record worklog entry and checkpoint.
    ///
    /// A runner-level failure (spawn, timeout) becomes a synthetic ERROR
    /// signal so the attempt still appears in `phase_results`.
    async fn run_phase(
        &self,
        phase: &PhaseDefinition,
        attempt: u32,
        provider: &str,
        ctx: &BeadContext,
        feedback: &str,
        siblings: &[SiblingSummary],
    ) -> PhaseCall {
        let prompt = match prompt::compose(self.project_root, &phase.name, ctx, feedback, siblings)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                return PhaseCall::Done(self.record(
                    &ctx.task_id,
                    phase,
                    attempt,
                    provider,
                    chrono::Utc::now().to_rfc3339(),
                    0,
                    Signal::synthetic_error(&format!("prompt composition failed: {}", e)),
                ))
            }
        };

        let timeout = self.timeout_for(phase, attempt);
        let log_path = self.logs_dir.join(format!("{}.log", phase.name));

        log_info!(
            "[{}][{}] Starting phase (attempt {}, provider {})",
            ctx.task_id,
            phase.name.to_uppercase(),
            attempt,
            provider
        );

        let started_at = chrono::Utc::now().to_rfc3339();
        let started = std::time::Instant::now();

        // The runner owns cancellation for the in-flight subprocess: a
        // cancelled token tears the process group down before this returns.
        let completion = self
            .runner
            .run_completion(provider, &prompt, &self.workdir, &log_path, timeout)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;

        let signal = match completion {
            Ok(output) => output.signal,
            Err(e) => {
                if e == crate::provider::CANCELLED {
                    return PhaseCall::Cancelled;
                }
                Signal::synthetic_error(&e)
            }
        };

        PhaseCall::Done(self.record(
            &ctx.task_id,
            phase,
            attempt,
            provider,
            started_at,
            duration_ms,
            signal,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        bead_id: &str,
        phase: &PhaseDefinition,
        attempt: u32,
        provider: &str,
        started_at: String,
        duration_ms: u64,
        signal: Signal,
    ) -> PhaseResult {
        if self.write_worklog {
            if let Err(e) = worklog::append_entry(&self.workdir, &phase.name, attempt, &signal) {
                log_warn!("Warning: failed to append worklog entry: {}", e);
            }
        }

        let result = PhaseResult {
            phase_name: phase.name.clone(),
            attempt,
            signal: signal.clone(),
            started_at,
            duration_ms,
            provider_used: provider.to_string(),
        };

        if self.config.pipeline.checkpoint {
            let checkpoint = Checkpoint {
                bead_id: bead_id.to_string(),
                phase_name: phase.name.clone(),
                attempt,
                last_signal: signal,
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            if let Err(e) = save_checkpoint(&self.checkpoint_dir, &checkpoint) {
                log_warn!("Warning: failed to write checkpoint: {}", e);
            }
        }

        result
    }

    /// Provider for a phase call at a given attempt: escalation replaces
    /// the default once the attempt index reaches `escalate_after + 1`.
    /// Fail first with the default provider, then invest in a stronger
    /// model rather than loop on the same model's weakness.
    fn provider_for(&self, phase: &PhaseDefinition, attempt: u32) -> String {
        let retry = &self.config.pipeline.retry;
        let escalate_provider = phase
            .escalate_provider
            .as_ref()
            .or(retry.escalate_provider.as_ref());
        let escalate_after = phase.escalate_after.or(retry.escalate_after);

        if let (Some(provider), Some(after)) = (escalate_provider, escalate_after) {
            if attempt >= after + 1 {
                return provider.clone();
            }
        }

        phase
            .provider
            .clone()
            .unwrap_or_else(|| self.config.runtime.provider.clone())
    }

    /// Effective timeout for an attempt: the base, multiplied by
    /// `backoff_factor` per retry when enabled.
    fn timeout_for(&self, phase: &PhaseDefinition, attempt: u32) -> Duration {
        let base = phase
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.runtime.timeout);

        let factor = self.config.pipeline.retry.backoff_factor;
        if factor <= 0.0 || attempt <= 1 {
            return base;
        }

        base.mul_f64(factor.powi(attempt as i32 - 1))
    }

    fn cancelled_outcome(&self, results: &[PhaseResult]) -> StageOutcome {
        // Mid-phase cancellation aborts; the workspace is preserved. With
        // checkpointing the boundary state is on disk, so the run pauses
        // instead.
        if self.config.pipeline.checkpoint && !results.is_empty() {
            StageOutcome::Paused
        } else {
            StageOutcome::Abort("cancelled".to_string())
        }
    }

    fn failed(&self, phase_results: Vec<PhaseResult>, failure: String) -> PipelineOutput {
        PipelineOutput {
            completed: false,
            phase_results,
            final_status: PipelineStatus::Failed,
            failure: Some(failure),
        }
    }

    fn paused(&self, phase_results: Vec<PhaseResult>) -> PipelineOutput {
        PipelineOutput {
            completed: false,
            phase_results,
            final_status: PipelineStatus::Paused,
            failure: None,
        }
    }
}
