use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::cap_error::CapError;
use crate::log_warn;

/// Branch prefix for per-bead workspaces.
const BRANCH_PREFIX: &str = "capsule-";

/// Validate a bead ID for use as a directory and branch name.
///
/// Rules: non-empty, no `/` or `\`, not `.` or `..`, must not start with
/// `-` (flag injection into git).
pub fn validate_bead_id(id: &str) -> Result<(), CapError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('-')
        && !id.contains('/')
        && !id.contains('\\');

    if valid {
        Ok(())
    } else {
        Err(CapError::InvalidId(id.to_string()))
    }
}

/// The branch a bead's workspace lives on.
pub fn branch_name(id: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, id)
}

/// Manages isolated per-bead workspaces as linked git worktrees.
///
/// Workspaces live at `{base_dir}/{id}` on branch `capsule-{id}`. The git
/// repository at `repo_root` is the shared substrate; it serializes updates
/// to the main branch.
#[derive(Clone)]
pub struct WorkspaceManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(repo_root: &Path, base_dir: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Create a workspace for `id`, branched from `base_branch`.
    ///
    /// Fails with `AlreadyExists` if the directory is present -- two
    /// concurrent pipelines for the same bead are forbidden by
    /// construction. On substrate failure any partial directory is
    /// removed best-effort.
    pub fn create(&self, id: &str, base_branch: &str) -> Result<PathBuf, CapError> {
        validate_bead_id(id)?;

        let path = self.path_for(id);
        if path.exists() {
            return Err(CapError::AlreadyExists(id.to_string()));
        }

        fs::create_dir_all(&self.base_dir)
            .map_err(|e| CapError::Io(format!("Failed to create {}: {}", self.base_dir.display(), e)))?;

        let path_str = path_to_str(&path)?;
        let result = run_git(
            &[
                "worktree",
                "add",
                "-b",
                &branch_name(id),
                path_str,
                base_branch,
            ],
            &self.repo_root,
        );

        if let Err(e) = result {
            if path.exists() {
                if let Err(rm_err) = fs::remove_dir_all(&path) {
                    log_warn!(
                        "Warning: failed to clean up partial workspace {}: {}",
                        path.display(),
                        rm_err
                    );
                }
            }
            return Err(e);
        }

        Ok(path)
    }

    /// Force-remove a workspace; optionally delete its branch.
    /// Unknown IDs fail with `NotFound`.
    pub fn remove(&self, id: &str, delete_branch: bool) -> Result<(), CapError> {
        validate_bead_id(id)?;

        let path = self.path_for(id);
        if !path.exists() {
            return Err(CapError::NotFound(format!("workspace {}", id)));
        }

        let path_str = path_to_str(&path)?;
        if run_git(&["worktree", "remove", "--force", path_str], &self.repo_root).is_err() {
            // Directory present but not registered (left by a crash):
            // delete it directly and let prune reconcile the substrate.
            fs::remove_dir_all(&path)
                .map_err(|e| CapError::Io(format!("Failed to remove {}: {}", path.display(), e)))?;
            self.prune()?;
        }

        if delete_branch {
            run_git(&["branch", "-D", &branch_name(id)], &self.repo_root)?;
        }

        Ok(())
    }

    /// Garbage-collect stale worktree registrations whose directories have
    /// vanished. Idempotent.
    pub fn prune(&self) -> Result<(), CapError> {
        run_git(&["worktree", "prune"], &self.repo_root).map(|_| ())
    }

    /// List active workspace IDs: on-disk directories under the base that
    /// are also registered with the substrate, sorted. A stale directory
    /// left by a crash must not masquerade as an active workspace.
    pub fn list(&self) -> Result<Vec<String>, CapError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CapError::Io(format!(
                    "Failed to read {}: {}",
                    self.base_dir.display(),
                    e
                )))
            }
        };

        let registered = self.registered_worktree_paths()?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CapError::Io(e.to_string()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let is_registered = registered
                .iter()
                .any(|reg| same_path(reg, &path));
            if is_registered {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Merge `capsule-{id}` into `main_branch` with the no-fast-forward
    /// policy.
    ///
    /// If the substrate reports a conflict, the merge is aborted to restore
    /// a clean state and the call fails with `MergeConflict`. Any other
    /// substrate failure is returned as a wrapped git error.
    pub fn merge_to_main(
        &self,
        id: &str,
        main_branch: &str,
        commit_msg: &str,
    ) -> Result<(), CapError> {
        validate_bead_id(id)?;

        run_git(&["checkout", main_branch], &self.repo_root)?;

        let branch = branch_name(id);
        let (success, output) = run_git_capture(
            &["merge", "--no-ff", "-m", commit_msg, &branch],
            &self.repo_root,
        )?;

        if output.contains("CONFLICT") {
            if let Err(e) = run_git(&["merge", "--abort"], &self.repo_root) {
                log_warn!("Warning: failed to abort conflicted merge: {}", e);
            }
            return Err(CapError::MergeConflict(id.to_string()));
        }

        if !success {
            return Err(CapError::Git(format!(
                "merge of {} failed: {}",
                branch,
                output.trim()
            )));
        }

        Ok(())
    }

    /// Determine the main-line branch: the remote HEAD symbolic reference
    /// first, then probing for `main` and `master`.
    pub fn detect_main_branch(&self) -> Result<String, CapError> {
        if let Ok(symref) = run_git(
            &["symbolic-ref", "refs/remotes/origin/HEAD"],
            &self.repo_root,
        ) {
            if let Some(branch) = symref.trim().rsplit('/').next() {
                if !branch.is_empty() {
                    return Ok(branch.to_string());
                }
            }
        }

        for candidate in ["main", "master"] {
            let reference = format!("refs/heads/{}", candidate);
            if run_git(&["show-ref", "--verify", "--quiet", &reference], &self.repo_root).is_ok() {
                return Ok(candidate.to_string());
            }
        }

        Err(CapError::Git(
            "cannot detect main branch: no remote HEAD, no 'main', no 'master'".to_string(),
        ))
    }

    /// Paths of all worktrees registered with the substrate.
    fn registered_worktree_paths(&self) -> Result<Vec<PathBuf>, CapError> {
        let output = run_git(&["worktree", "list", "--porcelain"], &self.repo_root)?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }
}

/// Compare paths with canonicalization, falling back to literal equality
/// when either path cannot be resolved.
fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}

fn path_to_str(path: &Path) -> Result<&str, CapError> {
    path.to_str()
        .ok_or_else(|| CapError::Io(format!("Path contains invalid UTF-8: {:?}", path)))
}

// --- Git plumbing ---

/// Run a git command in `repo_dir` and return its stdout. Non-zero exit is
/// an error carrying trimmed stderr.
pub fn run_git(args: &[&str], repo_dir: &Path) -> Result<String, CapError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CapError::Git(format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CapError::Git(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| CapError::Git(format!("git output is not valid UTF-8: {}", e)))
}

/// Run a git command and return `(success, combined stdout+stderr)`
/// regardless of exit status. Used where the output must be inspected on
/// failure (conflict markers).
fn run_git_capture(args: &[&str], repo_dir: &Path) -> Result<(bool, String), CapError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CapError::Git(format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e)))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok((output.status.success(), combined))
}
