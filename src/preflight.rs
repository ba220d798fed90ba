use std::path::Path;

use crate::cap_error::CapError;
use crate::config::CapsuleConfig;
use crate::provider;
use crate::workspace::run_git;

/// Verify only that a git repository exists in the given directory.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), CapError> {
    run_git(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| CapError::Git("Not a git repository (or git is not installed)".to_string()))?;
    Ok(())
}

/// Verify preconditions for safe pipeline operation.
///
/// Checks:
/// - A git repository exists (`git rev-parse --git-dir`)
/// - The main line's working tree is clean (`git status --porcelain`)
/// - Not in detached HEAD state
/// - The configured default provider CLI is on PATH
///
/// Any failure here is a setup error (exit code 2): nothing has run yet.
pub fn check(repo_dir: &Path, config: &CapsuleConfig) -> Result<(), CapError> {
    is_git_repo(repo_dir)?;

    let status = run_git(&["status", "--porcelain"], repo_dir)?;
    if !status.trim().is_empty() {
        return Err(CapError::Config(
            "Working tree is not clean. Commit or stash changes before running capsule."
                .to_string(),
        ));
    }

    if run_git(&["symbolic-ref", "--quiet", "HEAD"], repo_dir).is_err() {
        return Err(CapError::Config(
            "Detached HEAD state detected. Check out a branch before running capsule.".to_string(),
        ));
    }

    let default_provider = config
        .providers
        .get(&config.runtime.provider)
        .ok_or_else(|| {
            CapError::Config(format!(
                "runtime.provider '{}' is not defined in [providers]",
                config.runtime.provider
            ))
        })?;
    provider::verify_tool(default_provider).map_err(CapError::Config)?;

    Ok(())
}
