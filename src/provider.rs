use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::signal::{parse_signal, Signal};
use crate::{log_debug, log_warn};

/// Grace period between SIGTERM and SIGKILL when tearing a group down.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a terminated group to exit.
const TERM_POLL: Duration = Duration::from_millis(100);

/// Error string a cancelled completion call returns. The orchestrator
/// matches on it to distinguish cancellation from real failures.
pub const CANCELLED: &str = "cancelled";

/// Tear down a subprocess group: SIGTERM, poll until it exits, SIGKILL any
/// survivor after the grace period.
///
/// killpg never blocks, so the wait is plain async sleeps on the runtime.
async fn terminate_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};

    let pgid = Pid::from_raw(pgid);
    if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
        return; // already gone
    }

    let deadline = tokio::time::Instant::now() + TERM_GRACE;
    while tokio::time::Instant::now() < deadline {
        // Signal 0 probes for existence without sending anything.
        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, None) {
            return;
        }
        tokio::time::sleep(TERM_POLL).await;
    }

    let _ = killpg(pgid, Signal::SIGKILL);
}

// --- Completion seam ---

/// One completion call's result: the full raw stdout plus the signal
/// extracted from it. The signal is ALWAYS derived from stdout -- a
/// non-zero exit from the completion tool does not by itself mean ERROR.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionOutput {
    pub raw_output: String,
    pub signal: Signal,
}

impl CompletionOutput {
    /// Build an output whose raw text is the signal's own wire form.
    /// Used by mocks and tests.
    pub fn from_signal(signal: Signal) -> Self {
        let raw_output = serde_json::to_string(&signal).unwrap_or_default();
        Self { raw_output, signal }
    }
}

/// Trait for running completion providers. Enables mocking in pipeline
/// tests. `provider` names an entry in the configured provider table;
/// escalation passes a different name mid-pair.
pub trait CompletionRunner: Send + Sync {
    fn run_completion(
        &self,
        provider: &str,
        prompt: &str,
        workdir: &Path,
        log_path: &Path,
        timeout: Duration,
    ) -> impl Future<Output = Result<CompletionOutput, String>> + Send;
}

/// Verify that a provider's CLI tool is available on PATH.
pub fn verify_tool(config: &ProviderConfig) -> Result<(), String> {
    let output = std::process::Command::new(config.tool.binary_name())
        .args(config.tool.version_args())
        .output()
        .map_err(|e| {
            format!(
                "{} not found on PATH. {} ({})",
                config.tool.display_name(),
                config.tool.install_hint(),
                e
            )
        })?;

    if !output.status.success() {
        return Err(format!(
            "{} found but `{} {}` failed",
            config.tool.display_name(),
            config.tool.binary_name(),
            config.tool.version_args().join(" ")
        ));
    }

    Ok(())
}

/// Real implementation that spawns a provider CLI as a subprocess.
///
/// Carries the run's cancellation token: a cancelled token tears down the
/// in-flight subprocess group before the call returns `CANCELLED`, so no
/// grandchild outlives the orchestrator.
pub struct CliCompletionRunner {
    providers: HashMap<String, ProviderConfig>,
    cancel: CancellationToken,
}

impl CliCompletionRunner {
    pub fn new(providers: HashMap<String, ProviderConfig>, cancel: CancellationToken) -> Self {
        Self { providers, cancel }
    }
}

impl CompletionRunner for CliCompletionRunner {
    async fn run_completion(
        &self,
        provider: &str,
        prompt: &str,
        workdir: &Path,
        log_path: &Path,
        timeout: Duration,
    ) -> Result<CompletionOutput, String> {
        let config = self
            .providers
            .get(provider)
            .ok_or_else(|| format!("Provider '{}' is not configured", provider))?;

        let mut cmd = tokio::process::Command::new(config.tool.binary_name());
        cmd.args(config.tool.build_args(prompt, config.model.as_deref()));
        cmd.current_dir(workdir);
        run_subprocess_completion(cmd, log_path, timeout, &self.cancel).await
    }
}

/// Spawn a completion subprocess, stream its output to the per-phase log
/// file, enforce the timeout, and extract the signal from stdout.
///
/// The caller configures the `Command` (program, args, workdir); this
/// function handles process group isolation, capture, timeout,
/// cancellation, and parsing. Timeout and cancellation both kill the whole
/// process group, not just the direct child.
pub async fn run_subprocess_completion(
    mut cmd: tokio::process::Command,
    log_path: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CompletionOutput, String> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }

    let mut log_file = tokio::fs::File::create(log_path)
        .await
        .map_err(|e| format!("Failed to create log file {}: {}", log_path.display(), e))?;

    // stdin MUST be null -- with setpgid the child is in a background
    // process group, and any attempt to read from the terminal would cause
    // SIGTTIN (silent stop). stdout is captured for signal extraction;
    // stderr is captured only to reach the log file.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is
    // async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[provider] Spawning subprocess...");
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    log_debug!("[provider] Subprocess spawned (pid={})", child_pid);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture subprocess stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture subprocess stderr".to_string())?;

    // stderr drains concurrently so the child cannot block on a full pipe;
    // its lines land in the log after stdout.
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    log_debug!("[provider] Waiting (timeout={}s)...", timeout.as_secs());
    let run = async {
        let mut raw_output = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| format!("Error reading subprocess stdout: {}", e))?
        {
            log_file
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("Failed to write log: {}", e))?;
            log_file
                .write_all(b"\n")
                .await
                .map_err(|e| format!("Failed to write log: {}", e))?;
            raw_output.push_str(&line);
            raw_output.push('\n');
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("Error waiting for subprocess: {}", e))?;

        Ok::<_, String>((raw_output, status))
    };

    let outcome = tokio::select! {
        waited = tokio::time::timeout(timeout, run) => match waited {
            Err(_) => {
                log_debug!(
                    "[provider] TIMEOUT after {}s -- killing process group",
                    timeout.as_secs()
                );
                Err(format!(
                    "Completion provider timed out after {} seconds",
                    timeout.as_secs()
                ))
            }
            Ok(inner) => inner,
        },
        _ = cancel.cancelled() => {
            log_debug!("[provider] Cancelled -- killing process group");
            Err(CANCELLED.to_string())
        }
    };

    match outcome {
        Err(e) => {
            terminate_group(child_pid).await;
            stderr_task.abort();
            Err(e)
        }
        Ok((raw_output, exit_status)) => {
            log_debug!(
                "[provider] Subprocess exited (status={:?})",
                exit_status.code()
            );

            if let Ok(stderr_output) = stderr_task.await {
                if !stderr_output.is_empty() {
                    let _ = log_file.write_all(b"\n--- stderr ---\n").await;
                    let _ = log_file.write_all(stderr_output.as_bytes()).await;
                }
            }

            if !exit_status.success() {
                log_warn!(
                    "Warning: completion tool exited non-zero ({:?}); signal still taken from stdout",
                    exit_status.code()
                );
            }

            let signal = parse_signal(&raw_output);
            Ok(CompletionOutput { raw_output, signal })
        }
    }
}

// --- Mock runner ---

/// A single recorded call to the mock runner.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub provider: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Mock completion runner for pipeline tests.
///
/// Returns predefined results from a configurable sequence; each call pops
/// the next one. Calls are recorded for assertions on prompts, providers,
/// and ordering.
pub struct MockCompletionRunner {
    results: std::sync::Mutex<Vec<Result<CompletionOutput, String>>>,
    calls: std::sync::Mutex<Vec<RecordedCall>>,
}

impl MockCompletionRunner {
    /// Create a new mock with a sequence of results to return, in order.
    pub fn new(results: Vec<Result<CompletionOutput, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: std::sync::Mutex::new(reversed),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a sequence built from signals only.
    pub fn from_signals(signals: Vec<Signal>) -> Self {
        Self::new(
            signals
                .into_iter()
                .map(|s| Ok(CompletionOutput::from_signal(s)))
                .collect(),
        )
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CompletionRunner for MockCompletionRunner {
    async fn run_completion(
        &self,
        provider: &str,
        prompt: &str,
        _workdir: &Path,
        _log_path: &Path,
        timeout: Duration,
    ) -> Result<CompletionOutput, String> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            provider: provider.to_string(),
            prompt: prompt.to_string(),
            timeout,
        });
        let mut results = self.results.lock().expect("results lock");
        results
            .pop()
            .unwrap_or_else(|| Err("MockCompletionRunner: no more results in sequence".to_string()))
    }
}
