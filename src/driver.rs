use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::bead::{self, BeadTracker};
use crate::campaign::TaskPipeline;
use crate::cap_error::CapError;
use crate::config::CapsuleConfig;
use crate::pipeline::{
    load_checkpoint, PhaseDefinition, PipelineInput, PipelineOutput, PipelineRunner,
};
use crate::provider::CompletionRunner;
use crate::workspace::{validate_bead_id, WorkspaceManager};
use crate::worklog;
use crate::log_info;

/// Composes the single-bead flow: resolve -> create workspace -> instantiate
/// worklog -> run the phase pipeline. The workspace survives any failure so
/// the state can be inspected; only a completed pipeline's post-task
/// lifecycle removes it.
pub struct BeadPipelineDriver<'a, R: CompletionRunner, T: BeadTracker> {
    pub config: &'a CapsuleConfig,
    pub phases: &'a [PhaseDefinition],
    pub runner: &'a R,
    pub tracker: &'a T,
    pub workspaces: &'a WorkspaceManager,
    /// Repository root (prompt overlays, validation workdir).
    pub project_root: &'a Path,
    /// `{root}/{worktree.base_dir}` -- logs, checkpoints, campaigns.
    pub base_path: PathBuf,
    pub cancel: &'a CancellationToken,
}

impl<R: CompletionRunner, T: BeadTracker> BeadPipelineDriver<'_, R, T> {
    pub fn logs_dir(&self, bead_id: &str) -> PathBuf {
        self.base_path.join("logs").join(bead_id)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.base_path.join("checkpoints")
    }

    /// Acquire the bead's workspace: create a fresh one, or re-enter an
    /// existing one when a checkpoint shows an interrupted run. A
    /// workspace with no checkpoint behind it is a conflicting concurrent
    /// run and fails with `AlreadyExists`.
    async fn acquire_workspace(&self, bead_id: &str) -> Result<PathBuf, CapError> {
        let path = self.workspaces.path_for(bead_id);

        if path.exists() {
            let resumable = self.config.pipeline.checkpoint
                && load_checkpoint(&self.checkpoint_dir(), bead_id)?.is_some();
            if resumable {
                log_info!("[{}] Re-entering existing workspace for resume", bead_id);
                return Ok(path);
            }
            return Err(CapError::AlreadyExists(bead_id.to_string()));
        }

        let main_branch = {
            let ws = self.workspaces.clone();
            tokio::task::spawn_blocking(move || ws.detect_main_branch())
                .await
                .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))?
        };

        let ws = self.workspaces.clone();
        let id = bead_id.to_string();
        tokio::task::spawn_blocking(move || ws.create(&id, &main_branch))
            .await
            .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))
    }
}

impl<R: CompletionRunner, T: BeadTracker> TaskPipeline for BeadPipelineDriver<'_, R, T> {
    async fn run_task(&self, input: &PipelineInput) -> Result<PipelineOutput, CapError> {
        validate_bead_id(&input.bead_id)?;

        let ctx = bead::resolve(self.tracker, &input.bead_id).await?;
        let ctx = input.apply_to(ctx);

        let workspace = self.acquire_workspace(&input.bead_id).await?;
        worklog::instantiate(self.project_root, &workspace, &ctx)?;

        let runner = PipelineRunner {
            config: self.config,
            phases: self.phases,
            runner: self.runner,
            project_root: self.project_root,
            workdir: workspace,
            logs_dir: self.logs_dir(&input.bead_id),
            checkpoint_dir: self.checkpoint_dir(),
            cancel: self.cancel,
            write_worklog: true,
        };

        Ok(runner.run(&ctx, &input.sibling_context).await)
    }

    /// Validation pipelines run against the parent bead on the main line
    /// after all child merges have landed: no workspace, no worklog.
    async fn run_validation(
        &self,
        parent_id: &str,
        phase_names: &[String],
    ) -> Result<PipelineOutput, CapError> {
        let phases: Vec<PhaseDefinition> = phase_names
            .iter()
            .map(|name| {
                self.phases
                    .iter()
                    .find(|p| p.name == *name)
                    .cloned()
                    .map(|mut p| {
                        // Validation phases run standalone.
                        p.paired_with = None;
                        p.retry_target = None;
                        p
                    })
                    .ok_or_else(|| {
                        CapError::Config(format!(
                            "campaign.validation_phases names unknown phase '{}'",
                            name
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let ctx = bead::resolve(self.tracker, parent_id).await?;

        let runner = PipelineRunner {
            config: self.config,
            phases: &phases,
            runner: self.runner,
            project_root: self.project_root,
            workdir: self.project_root.to_path_buf(),
            logs_dir: self.logs_dir(parent_id),
            checkpoint_dir: self.checkpoint_dir(),
            cancel: self.cancel,
            write_worklog: false,
        };

        Ok(runner.run(&ctx, &[]).await)
    }
}
