use std::collections::HashSet;
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::bead::{BeadInfo, BeadTracker, NewBead};
use crate::cap_error::CapError;
use crate::config::{CampaignConfig, FailureMode};
use crate::pipeline::{PipelineInput, PipelineOutput, PipelineStatus};
use crate::prompt::SiblingSummary;
use crate::state::{CampaignState, CampaignStatus, StateStore, TaskResult, TaskStatus};
use crate::{log_info, log_warn};

/// Most recent siblings carried into a task prompt when cross-run context
/// is enabled.
const SIBLING_CONTEXT_CAP: usize = 10;

// --- Seams ---

/// Runs one bead through the phase pipeline. The campaign never touches
/// workspaces or providers directly; the composition root injects this.
pub trait TaskPipeline: Send + Sync {
    fn run_task(
        &self,
        input: &PipelineInput,
    ) -> impl Future<Output = Result<PipelineOutput, CapError>> + Send;

    /// Run a validation pipeline against a parent bead on the main line.
    fn run_validation(
        &self,
        parent_id: &str,
        phases: &[String],
    ) -> impl Future<Output = Result<PipelineOutput, CapError>> + Send;
}

/// Per-task lifecycle hook (merge/cleanup/close), injected by the
/// composition root. Runs on tasks only, never on feature or epic beads.
pub trait TaskLifecycle: Send + Sync {
    fn after_task(
        &self,
        bead_id: &str,
        title: &str,
    ) -> impl Future<Output = Result<(), CapError>> + Send;
}

/// Resolves a merge conflict out of band. On success the post-task hook is
/// retried once; an unresolved conflict pauses the campaign.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, bead_id: &str) -> impl Future<Output = Result<(), CapError>> + Send;
}

/// Placeholder resolver type for campaigns configured without one.
pub struct NoConflictResolver;

impl ConflictResolver for NoConflictResolver {
    async fn resolve(&self, _bead_id: &str) -> Result<(), CapError> {
        Err(CapError::CampaignPaused("no conflict resolver".to_string()))
    }
}

/// Campaign callbacks, invoked synchronously from the campaign task.
/// Implementations must not block; forward events to your own event loop.
/// `depth` lets a UI render nested sub-campaigns without overwriting the
/// parent frame.
pub trait CampaignObserver: Send + Sync {
    fn on_campaign_started(&self, _parent_id: &str, _depth: u32, _total_tasks: usize) {}
    fn on_task_started(&self, _bead_id: &str, _idx: usize, _total: usize, _depth: u32) {}
    fn on_task_finished(&self, _bead_id: &str, _status: TaskStatus, _depth: u32) {}
    fn on_campaign_finished(&self, _parent_id: &str, _status: CampaignStatus, _depth: u32) {}
    fn on_validation_result(&self, _parent_id: &str, _passed: bool) {}
}

/// Observer that ignores every event.
pub struct NullObserver;

impl CampaignObserver for NullObserver {}

// --- Runner ---

/// Recursively drives a parent bead's ready children, sequencing task
/// pipelines one at a time. Each task's merge must land on main before the
/// next task branches, so there is no intra-campaign parallelism.
pub struct CampaignRunner<'a, P, T, H, C, O>
where
    P: TaskPipeline,
    T: BeadTracker,
    H: TaskLifecycle,
    C: ConflictResolver,
    O: CampaignObserver,
{
    pub config: &'a CampaignConfig,
    pub pipeline: &'a P,
    pub tracker: &'a T,
    pub post_task: &'a H,
    pub conflict_resolver: Option<&'a C>,
    pub observer: &'a O,
    pub store: &'a StateStore,
    pub cancel: &'a CancellationToken,
}

impl<P, T, H, C, O> CampaignRunner<'_, P, T, H, C, O>
where
    P: TaskPipeline,
    T: BeadTracker,
    H: TaskLifecycle,
    C: ConflictResolver,
    O: CampaignObserver,
{
    /// Walk the ready children of `parent_id` in order, recursing into
    /// feature/epic children and running task pipelines for the rest.
    pub async fn run(&self, parent_id: &str) -> Result<CampaignState, CapError> {
        let mut visited = HashSet::new();
        self.run_inner(parent_id, 1, &mut visited).await
    }

    fn run_inner<'s>(
        &'s self,
        parent_id: &'s str,
        depth: u32,
        visited: &'s mut HashSet<String>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<CampaignState, CapError>> + Send + 's>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(CapError::MaxDepth(depth, self.config.max_depth));
            }
            if !visited.insert(parent_id.to_string()) {
                return Err(CapError::Cycle(parent_id.to_string()));
            }

            let children = self.tracker.ready_children(parent_id).await?;
            if children.is_empty() {
                return Err(CapError::NoTasks(parent_id.to_string()));
            }

            let mut state = match self.store.load(parent_id)? {
                // A fully-completed campaign re-run produces no new
                // pipeline invocations.
                Some(state) if state.status == CampaignStatus::Completed => {
                    self.observer
                        .on_campaign_finished(parent_id, state.status, depth);
                    return Ok(state);
                }
                Some(mut state) => {
                    state.normalize_for_resume();
                    reconcile_new_children(&mut state, &children);
                    log_info!(
                        "[{}] Resuming campaign at task {}/{}",
                        parent_id,
                        state.current_task_idx + 1,
                        state.tasks.len()
                    );
                    state
                }
                None => {
                    let ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
                    let mut state = CampaignState::new(parent_id, &ids);
                    for (task, child) in state.tasks.iter_mut().zip(children.iter()) {
                        task.title = child.title.clone();
                    }
                    state
                }
            };

            self.observer
                .on_campaign_started(parent_id, depth, state.tasks.len());

            let total = state.tasks.len();
            for idx in state.current_task_idx..total {
                if self.cancel.is_cancelled() {
                    state.status = CampaignStatus::Paused;
                    self.save_warn(&state);
                    return Err(CapError::CampaignPaused("cancelled".to_string()));
                }

                if state.tasks[idx].status.is_terminal() {
                    state.current_task_idx = idx + 1;
                    self.save_warn(&state);
                    continue;
                }

                let bead_id = state.tasks[idx].bead_id.clone();
                let child = children.iter().find(|c| c.id == bead_id).cloned();
                let is_grouping = child
                    .as_ref()
                    .map(|c| c.issue_type.is_grouping())
                    .unwrap_or(false);

                state.current_task_idx = idx;
                state.tasks[idx].status = TaskStatus::Running;
                self.save_warn(&state);
                self.observer.on_task_started(&bead_id, idx, total, depth);

                let task_status = if is_grouping {
                    self.run_sub_campaign(&mut state, idx, &bead_id, depth, visited)
                        .await?
                } else {
                    self.run_task_pipeline(&mut state, idx, &bead_id, child.as_ref(), parent_id)
                        .await?
                };

                state.tasks[idx].status = task_status;
                self.observer.on_task_finished(&bead_id, task_status, depth);

                // Circuit breaker: consecutive task failures; success resets.
                if task_status == TaskStatus::Failed {
                    state.consecutive_failures += 1;
                    if self.config.circuit_breaker > 0
                        && state.consecutive_failures >= self.config.circuit_breaker
                    {
                        state.status = CampaignStatus::Failed;
                        state.current_task_idx = idx + 1;
                        self.save_warn(&state);
                        return Err(CapError::CircuitBroken(state.consecutive_failures));
                    }
                    if self.config.failure_mode == FailureMode::Abort {
                        state.status = CampaignStatus::Failed;
                        state.current_task_idx = idx + 1;
                        self.save_warn(&state);
                        self.observer
                            .on_campaign_finished(parent_id, state.status, depth);
                        return Ok(state);
                    }
                } else {
                    state.consecutive_failures = 0;
                }

                state.current_task_idx = idx + 1;
                self.save_warn(&state);
            }

            let all_clean = state
                .tasks
                .iter()
                .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped));
            state.status = if all_clean {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Failed
            };
            self.save_warn(&state);

            if all_clean && !self.config.validation_phases.is_empty() {
                self.run_validation(parent_id).await;
            }

            if all_clean && self.tracker.available() {
                if let Err(e) = self.tracker.close(parent_id).await {
                    log_warn!("Warning: failed to close parent bead {}: {}", parent_id, e);
                }
            }

            self.observer
                .on_campaign_finished(parent_id, state.status, depth);
            Ok(state)
        })
    }

    /// Recurse into a feature/epic child. Structural failures propagate
    /// after this campaign's state is parked; an empty sub-campaign is
    /// recorded as skipped.
    async fn run_sub_campaign(
        &self,
        state: &mut CampaignState,
        idx: usize,
        child_id: &str,
        depth: u32,
        visited: &mut HashSet<String>,
    ) -> Result<TaskStatus, CapError> {
        match self.run_inner(child_id, depth + 1, visited).await {
            Ok(sub) => Ok(match sub.status {
                CampaignStatus::Completed => TaskStatus::Completed,
                _ => TaskStatus::Failed,
            }),
            Err(CapError::NoTasks(_)) => {
                log_info!("[{}] No ready children; skipping", child_id);
                Ok(TaskStatus::Skipped)
            }
            Err(CapError::CampaignPaused(reason)) => {
                state.tasks[idx].status = TaskStatus::Pending;
                state.status = CampaignStatus::Paused;
                self.save_warn(state);
                Err(CapError::CampaignPaused(reason))
            }
            Err(e) => {
                state.tasks[idx].status = TaskStatus::Failed;
                state.status = CampaignStatus::Failed;
                self.save_warn(state);
                Err(e)
            }
        }
    }

    /// Run one task pipeline plus its post-task lifecycle. Returns the
    /// task's terminal status, or propagates a campaign pause.
    async fn run_task_pipeline(
        &self,
        state: &mut CampaignState,
        idx: usize,
        bead_id: &str,
        child: Option<&BeadInfo>,
        parent_id: &str,
    ) -> Result<TaskStatus, CapError> {
        let input = PipelineInput {
            bead_id: bead_id.to_string(),
            title: child.map(|c| c.title.clone()),
            description: child.map(|c| c.description.clone()),
            sibling_context: if self.config.cross_run_context {
                sibling_context(state)
            } else {
                Vec::new()
            },
        };

        let output = match self.pipeline.run_task(&input).await {
            Ok(output) => output,
            Err(e) => {
                state.tasks[idx].error = Some(e.to_string());
                return Ok(TaskStatus::Failed);
            }
        };

        state.tasks[idx].phase_results = output.phase_results.clone();

        // Findings become new child beads regardless of the run's outcome.
        self.file_findings(parent_id, &output).await;

        match output.final_status {
            PipelineStatus::Paused => {
                state.tasks[idx].status = TaskStatus::Pending;
                state.status = CampaignStatus::Paused;
                self.save_warn(state);
                Err(CapError::CampaignPaused(format!(
                    "pipeline for {} paused",
                    bead_id
                )))
            }
            PipelineStatus::Failed => {
                state.tasks[idx].error = output.failure.clone();
                Ok(TaskStatus::Failed)
            }
            PipelineStatus::Completed => {
                let title = child.map(|c| c.title.as_str()).unwrap_or("");
                self.run_post_task(state, idx, bead_id, title).await
            }
        }
    }

    /// Invoke the injected post-task hook, routing merge conflicts through
    /// the resolver when one is configured. An unresolved conflict pauses
    /// the campaign with the task back at pending.
    async fn run_post_task(
        &self,
        state: &mut CampaignState,
        idx: usize,
        bead_id: &str,
        title: &str,
    ) -> Result<TaskStatus, CapError> {
        match self.post_task.after_task(bead_id, title).await {
            Ok(()) => Ok(TaskStatus::Completed),
            Err(CapError::MergeConflict(_)) => {
                if let Some(resolver) = self.conflict_resolver {
                    log_info!("[{}] Merge conflict; invoking conflict resolver", bead_id);
                    if resolver.resolve(bead_id).await.is_ok() {
                        // Resolved: the merge is retried once.
                        match self.post_task.after_task(bead_id, title).await {
                            Ok(()) => return Ok(TaskStatus::Completed),
                            Err(e) => {
                                log_warn!("Warning: merge retry for {} failed: {}", bead_id, e)
                            }
                        }
                    }
                }
                state.tasks[idx].status = TaskStatus::Pending;
                state.status = CampaignStatus::Paused;
                self.save_warn(state);
                Err(CapError::CampaignPaused(format!(
                    "merge conflict on {}",
                    bead_id
                )))
            }
            Err(e) => {
                // Post-task steps are best-effort; the task's success is
                // not downgraded.
                log_warn!("Warning: post-task hook for {} failed: {}", bead_id, e);
                Ok(TaskStatus::Completed)
            }
        }
    }

    /// File reviewer findings as new child beads under the current parent.
    /// Persistence is best-effort -- a failed filing warns and continues.
    async fn file_findings(&self, parent_id: &str, output: &PipelineOutput) {
        if !self.config.discovery_filing {
            return;
        }

        for result in &output.phase_results {
            for finding in &result.signal.findings {
                let bead = NewBead {
                    parent: parent_id.to_string(),
                    title: finding.title.clone(),
                    description: finding.description.clone(),
                    priority: finding.severity.priority(),
                };
                match self.tracker.create(&bead).await {
                    Ok(id) => log_info!(
                        "[{}] Filed discovery {} ({})",
                        parent_id,
                        id,
                        finding.title
                    ),
                    Err(e) => log_warn!(
                        "Warning: failed to file discovery '{}': {}",
                        finding.title,
                        e
                    ),
                }
            }
        }
    }

    /// Run the validation sub-pipeline against the parent itself. Results
    /// are reported via the observer and never alter child outcomes.
    async fn run_validation(&self, parent_id: &str) {
        log_info!("[{}] Running validation phases", parent_id);
        match self
            .pipeline
            .run_validation(parent_id, &self.config.validation_phases)
            .await
        {
            Ok(output) => self
                .observer
                .on_validation_result(parent_id, output.completed),
            Err(e) => {
                log_warn!("Warning: validation pipeline for {} failed: {}", parent_id, e);
                self.observer.on_validation_result(parent_id, false);
            }
        }
    }

    /// State-store failures are logged warnings, never fatal.
    fn save_warn(&self, state: &CampaignState) {
        if let Err(e) = self.store.save(state) {
            log_warn!("Warning: failed to save campaign state: {}", e);
        }
    }
}

// --- Pure helpers ---

/// Append children discovered since the pause (e.g. filed findings) to a
/// resumed task list, preserving the persisted order.
fn reconcile_new_children(state: &mut CampaignState, children: &[BeadInfo]) {
    for child in children {
        if !state.tasks.iter().any(|t| t.bead_id == child.id) {
            let mut task = TaskResult::pending(&child.id);
            task.title = child.title.clone();
            state.tasks.push(task);
        }
    }
}

/// Summaries of prior completed siblings, most recent `SIBLING_CONTEXT_CAP`.
fn sibling_context(state: &CampaignState) -> Vec<SiblingSummary> {
    let mut summaries: Vec<SiblingSummary> = state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| {
            t.phase_results.last().map(|last| {
                let mut files: Vec<String> = Vec::new();
                for result in &t.phase_results {
                    for file in &result.signal.files_changed {
                        if !files.contains(file) {
                            files.push(file.clone());
                        }
                    }
                }
                SiblingSummary {
                    bead_id: t.bead_id.clone(),
                    title: t.title.clone(),
                    summary: last.signal.summary.clone(),
                    files_changed: files,
                }
            })
        })
        .collect();

    if summaries.len() > SIBLING_CONTEXT_CAP {
        summaries.drain(..summaries.len() - SIBLING_CONTEXT_CAP);
    }
    summaries
}
