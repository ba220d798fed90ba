use std::path::{Path, PathBuf};

use crate::bead::BeadTracker;
use crate::cap_error::CapError;
use crate::workspace::WorkspaceManager;
use crate::worklog;
use crate::log_warn;

/// Outcome of the post-pipeline steps. Everything after the merge is
/// best-effort: failures land in `warnings`, never in `Err`.
#[derive(Debug, Default)]
pub struct LifecycleReport {
    pub merged: bool,
    pub archived_worklog: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Run the post-pipeline lifecycle for a completed task: merge the
/// worktree branch to main, archive the worklog, remove the workspace and
/// branch, prune, close the bead.
///
/// Only a merge conflict propagates as `Err` -- the campaign needs to
/// distinguish it to pause for resolution. Any other merge failure leaves
/// the workspace in place for inspection and is reported as a warning; the
/// pipeline's overall success is not downgraded.
pub async fn post_task(
    workspaces: &WorkspaceManager,
    tracker: &impl BeadTracker,
    bead_id: &str,
    title: &str,
    logs_base: &Path,
) -> Result<LifecycleReport, CapError> {
    let mut report = LifecycleReport::default();

    let main_branch = {
        let ws = workspaces.clone();
        tokio::task::spawn_blocking(move || ws.detect_main_branch())
            .await
            .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))?
    };

    let commit_msg = if title.is_empty() {
        bead_id.to_string()
    } else {
        format!("{}: {}", bead_id, title)
    };

    let merge_result = {
        let ws = workspaces.clone();
        let id = bead_id.to_string();
        let branch = main_branch.clone();
        tokio::task::spawn_blocking(move || ws.merge_to_main(&id, &branch, &commit_msg))
            .await
            .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))
    };

    // Archive the worklog before the workspace can disappear.
    let workspace_path = workspaces.path_for(bead_id);
    let logs_dir = logs_base.join(bead_id);
    match worklog::archive(&workspace_path, &logs_dir) {
        Ok(path) => report.archived_worklog = Some(path),
        Err(e) => report
            .warnings
            .push(format!("failed to archive worklog: {}", e)),
    }

    match merge_result {
        Ok(()) => report.merged = true,
        Err(CapError::MergeConflict(id)) => {
            // The workspace survives so the conflict can be resolved.
            return Err(CapError::MergeConflict(id));
        }
        Err(e) => {
            report
                .warnings
                .push(format!("merge to {} failed: {}", main_branch, e));
            warn_all(&report.warnings);
            return Ok(report);
        }
    }

    // Cleanup after a landed merge: workspace, branch, stale registrations.
    let removal = {
        let ws = workspaces.clone();
        let id = bead_id.to_string();
        tokio::task::spawn_blocking(move || ws.remove(&id, true))
            .await
            .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))
    };
    if let Err(e) = removal {
        report
            .warnings
            .push(format!("failed to remove workspace: {}", e));
    }

    let prune = {
        let ws = workspaces.clone();
        tokio::task::spawn_blocking(move || ws.prune())
            .await
            .unwrap_or_else(|e| Err(CapError::Git(format!("spawn_blocking panicked: {}", e))))
    };
    if let Err(e) = prune {
        report.warnings.push(format!("failed to prune: {}", e));
    }

    if tracker.available() {
        if let Err(e) = tracker.close(bead_id).await {
            report
                .warnings
                .push(format!("failed to close bead {}: {}", bead_id, e));
        }
    }

    warn_all(&report.warnings);
    Ok(report)
}

fn warn_all(warnings: &[String]) {
    for warning in warnings {
        log_warn!("Warning: {}", warning);
    }
}
