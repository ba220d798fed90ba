use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::cap_error::CapError;
use crate::pipeline::PhaseResult;

// --- Types ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub bead_id: String,
    #[serde(default)]
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub phase_results: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn pending(bead_id: &str) -> Self {
        Self {
            bead_id: bead_id.to_string(),
            title: String::new(),
            status: TaskStatus::Pending,
            phase_results: Vec::new(),
            error: None,
        }
    }
}

/// Campaign state persisted per root parent.
///
/// Invariant: `current_task_idx <= tasks.len()`, and every task at an index
/// below `current_task_idx` has a terminal status.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CampaignState {
    pub id: String,
    pub tasks: Vec<TaskResult>,
    pub current_task_idx: usize,
    pub consecutive_failures: u32,
    pub started_at: String,
    pub status: CampaignStatus,
}

impl CampaignState {
    pub fn new(id: &str, task_ids: &[String]) -> Self {
        Self {
            id: id.to_string(),
            tasks: task_ids.iter().map(|t| TaskResult::pending(t)).collect(),
            current_task_idx: 0,
            consecutive_failures: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            status: CampaignStatus::Running,
        }
    }

    /// Prepare a loaded state for re-entry: a task interrupted while
    /// `running` goes back to `pending`.
    pub fn normalize_for_resume(&mut self) {
        for task in &mut self.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
            }
        }
        if self.status == CampaignStatus::Paused {
            self.status = CampaignStatus::Running;
        }
    }
}

// --- Store ---

/// Persists campaign state, one JSON document per parent ID, under
/// `{base}/campaigns/`. Saves are atomic (write-rename discipline).
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn save(&self, state: &CampaignState) -> Result<(), CapError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| CapError::Io(format!("Failed to create {}: {}", self.dir.display(), e)))?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| CapError::Io(format!("Failed to serialize campaign state: {}", e)))?;

        let temp_file = NamedTempFile::new_in(&self.dir)
            .map_err(|e| CapError::Io(format!("Failed to create temp file in {}: {}", self.dir.display(), e)))?;

        fs::write(temp_file.path(), &json)
            .map_err(|e| CapError::Io(format!("Failed to write temp file: {}", e)))?;

        // sync to disk before rename
        let file = fs::File::open(temp_file.path())
            .map_err(|e| CapError::Io(format!("Failed to open temp file for sync: {}", e)))?;
        file.sync_all()
            .map_err(|e| CapError::Io(format!("Failed to sync temp file: {}", e)))?;

        let path = self.path_for(&state.id);
        temp_file
            .persist(&path)
            .map_err(|e| CapError::Io(format!("Failed to rename temp file to {}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Load the state for `id`. `Ok(None)` when no state has been saved.
    pub fn load(&self, id: &str) -> Result<Option<CampaignState>, CapError> {
        let path = self.path_for(id);
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

        let state = serde_json::from_str(&contents)
            .map_err(|e| CapError::Io(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    pub fn remove(&self, id: &str) -> Result<(), CapError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapError::Io(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
