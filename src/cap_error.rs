use std::time::Duration;

/// Error enum for every failure kind callers must distinguish.
///
/// Three channels exist for reporting:
/// - expected outcomes (PASS / NEEDS_WORK) travel as values, never here
/// - classifiable failures travel as `CapError` variants
/// - best-effort operations (state save, bead close, discovery filing)
///   warn via the log and continue -- they never surface as `CapError`
#[derive(Debug, thiserror::Error)]
pub enum CapError {
    // Setup errors -- exit code 2
    #[error("Invalid bead ID '{0}': must be non-empty, contain no path separators, not start with '-', and not be '.' or '..'")]
    InvalidId(String),

    #[error("Workspace for '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid configuration:\n{0}")]
    Config(String),

    #[error("Bead tracker CLI not found: {0}")]
    CliNotFound(String),

    // Absence
    #[error("Not found: {0}")]
    NotFound(String),

    // Pipeline failures -- exit code 1
    #[error("Phase '{phase}' gave up after {attempts} attempts. Last feedback: {feedback}")]
    RetriesExhausted {
        phase: String,
        attempts: u32,
        feedback: String,
    },

    #[error("Pipeline paused at checkpoint '{0}'")]
    PipelinePaused(String),

    #[error("No valid signal in process output")]
    SignalInvalid,

    // Campaign failures
    #[error("Circuit breaker tripped after {0} consecutive task failures")]
    CircuitBroken(u32),

    #[error("Campaign paused: {0}")]
    CampaignPaused(String),

    #[error("Campaign depth {0} exceeds the maximum of {1}")]
    MaxDepth(u32, u32),

    #[error("Cycle detected: '{0}' is already being campaigned")]
    Cycle(String),

    #[error("Parent '{0}' has no ready children")]
    NoTasks(String),

    // Substrate
    #[error("Merge of '{0}' hit conflicts; merge aborted, main restored")]
    MergeConflict(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Completion provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("{0}")]
    Io(String),
}

impl CapError {
    /// True for errors that indicate a misconfigured invocation rather than
    /// a pipeline outcome. These map to exit code 2.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            CapError::InvalidId(_)
                | CapError::Config(_)
                | CapError::CliNotFound(_)
                | CapError::AlreadyExists(_)
        )
    }

    /// True for pause outcomes: the run stopped for external resolution and
    /// is resumable. Pauses are not failures and map to exit code 0.
    pub fn is_pause(&self) -> bool {
        matches!(
            self,
            CapError::PipelinePaused(_) | CapError::CampaignPaused(_)
        )
    }
}

impl From<std::io::Error> for CapError {
    fn from(err: std::io::Error) -> Self {
        CapError::Io(err.to_string())
    }
}
