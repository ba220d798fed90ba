use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::bead::BeadContext;
use crate::cap_error::CapError;
use crate::prompt::interpolate;
use crate::signal::Signal;

/// File name of the per-bead mission briefing inside a workspace.
pub const WORKLOG_NAME: &str = "worklog.md";

const EMBEDDED_TEMPLATE: &str = include_str!("../templates/worklog.md.template");

/// Instantiate a workspace's worklog from the template.
///
/// A local `{root}/templates/worklog.md.template` overlays the embedded
/// default. An existing worklog is left untouched so a resumed pipeline
/// keeps its history.
pub fn instantiate(
    project_root: &Path,
    workspace: &Path,
    ctx: &BeadContext,
) -> Result<PathBuf, CapError> {
    let worklog_path = workspace.join(WORKLOG_NAME);
    if worklog_path.exists() {
        return Ok(worklog_path);
    }

    let template = load_template(project_root)?;

    let mut fields: HashMap<&str, String> = HashMap::new();
    fields.insert("BeadID", ctx.task_id.clone());
    fields.insert("Title", ctx.task_title.clone());
    fields.insert("Description", ctx.task_description.clone());
    fields.insert("AcceptanceCriteria", ctx.acceptance_criteria.clone());

    let contents = interpolate(&template, &fields)?;
    fs::write(&worklog_path, contents)
        .map_err(|e| CapError::Io(format!("Failed to write {}: {}", worklog_path.display(), e)))?;

    Ok(worklog_path)
}

fn load_template(project_root: &Path) -> Result<String, CapError> {
    let local = project_root.join("templates").join("worklog.md.template");
    if local.exists() {
        return fs::read_to_string(&local)
            .map_err(|e| CapError::Io(format!("Failed to read {}: {}", local.display(), e)));
    }
    Ok(EMBEDDED_TEMPLATE.to_string())
}

/// Append one entry per phase execution.
///
/// Format:
/// ```text
/// ## {datetime} — {phase} (attempt {n})
///
/// - **Status:** {status}
/// - **Summary:** {summary}
///
/// ---
/// ```
pub fn append_entry(
    workspace: &Path,
    phase: &str,
    attempt: u32,
    signal: &Signal,
) -> Result<(), CapError> {
    let worklog_path = workspace.join(WORKLOG_NAME);
    let datetime = chrono::Utc::now().to_rfc3339();

    let entry = format!(
        "\n## {} — {} (attempt {})\n\n- **Status:** {}\n- **Summary:** {}\n\n---\n",
        datetime, phase, attempt, signal.status, signal.summary,
    );

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&worklog_path)
        .map_err(|e| CapError::Io(format!("Failed to open {}: {}", worklog_path.display(), e)))?;

    file.write_all(entry.as_bytes())
        .map_err(|e| CapError::Io(format!("Failed to write {}: {}", worklog_path.display(), e)))?;

    Ok(())
}

/// Archive a workspace's worklog to `{logs_dir}/worklog.md` after a
/// successful merge. Returns the archive path.
pub fn archive(workspace: &Path, logs_dir: &Path) -> Result<PathBuf, CapError> {
    let source = workspace.join(WORKLOG_NAME);
    if !source.exists() {
        return Err(CapError::NotFound(format!(
            "worklog at {}",
            source.display()
        )));
    }

    fs::create_dir_all(logs_dir)
        .map_err(|e| CapError::Io(format!("Failed to create {}: {}", logs_dir.display(), e)))?;

    let dest = logs_dir.join(WORKLOG_NAME);
    fs::copy(&source, &dest)
        .map_err(|e| CapError::Io(format!("Failed to archive worklog to {}: {}", dest.display(), e)))?;

    Ok(dest)
}
