use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;

use serde::{Deserialize, Deserializer};

use crate::cap_error::CapError;
use crate::log_warn;

/// The external bead tracker binary.
const TRACKER_BINARY: &str = "bd";

// --- Types ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BeadType {
    #[default]
    Task,
    Feature,
    Epic,
}

impl BeadType {
    /// Feature and epic beads group children; only tasks run pipelines.
    pub fn is_grouping(&self) -> bool {
        matches!(self, BeadType::Feature | BeadType::Epic)
    }
}

/// Unknown issue types degrade to `Task` so a tracker with custom types
/// still routes work through the pipeline.
impl<'de> Deserialize<'de> for BeadType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_lowercase().as_str() {
            "feature" => BeadType::Feature,
            "epic" => BeadType::Epic,
            _ => BeadType::Task,
        })
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BeadDep {
    #[serde(rename = "type", default)]
    pub dep_type: String,
    #[serde(default)]
    pub target: String,
}

/// One bead as reported by the tracker. Absent fields degrade to empty
/// strings to match the resolver's graceful-degradation contract.
#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BeadInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub issue_type: BeadType,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<BeadDep>,
}

impl BeadInfo {
    /// Determine this bead's parent: an explicit `parent` field wins;
    /// otherwise scan the dependency array for a `parent-child` edge whose
    /// target is not the bead itself.
    pub fn parent_id(&self) -> Option<String> {
        if let Some(ref p) = self.parent {
            if !p.is_empty() {
                return Some(p.clone());
            }
        }
        self.dependencies
            .iter()
            .find(|d| d.dep_type == "parent-child" && d.target != self.id && !d.target.is_empty())
            .map(|d| d.target.clone())
    }
}

/// Immutable inputs for prompt interpolation. Built once per pipeline
/// invocation, read-only thereafter.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct BeadContext {
    pub task_id: String,
    pub task_title: String,
    pub task_description: String,
    pub acceptance_criteria: String,
    pub feature_id: Option<String>,
    pub feature_title: Option<String>,
    pub feature_goal: Option<String>,
    pub epic_id: Option<String>,
    pub epic_title: Option<String>,
    pub epic_goal: Option<String>,
}

impl BeadContext {
    /// Minimal context for when the tracker is unavailable.
    pub fn minimal(id: &str) -> Self {
        BeadContext {
            task_id: id.to_string(),
            ..Default::default()
        }
    }
}

/// A new bead filed from a reviewer finding.
#[derive(Clone, Debug, PartialEq)]
pub struct NewBead {
    pub parent: String,
    pub title: String,
    pub description: String,
    pub priority: u8,
}

// --- Tracker seam ---

/// Trait for the external bead tracker. Enables mocking in campaign tests.
pub trait BeadTracker: Send + Sync {
    /// Whether the tracker CLI is reachable at all.
    fn available(&self) -> bool;

    fn show(&self, id: &str) -> impl Future<Output = Result<BeadInfo, CapError>> + Send;

    /// Ready children of a parent, in the tracker's discovery order.
    fn ready_children(
        &self,
        parent: &str,
    ) -> impl Future<Output = Result<Vec<BeadInfo>, CapError>> + Send;

    /// File a new bead; returns the assigned ID.
    fn create(&self, bead: &NewBead) -> impl Future<Output = Result<String, CapError>> + Send;

    fn close(&self, id: &str) -> impl Future<Output = Result<(), CapError>> + Send;
}

/// Resolve a bead ID into a full context, walking the parent chain.
///
/// If the tracker is not available, returns a minimal context with no error.
/// If the tracker is available but the bead does not exist, returns
/// `NotFound`. Parent-chain lookups are best-effort: a missing parent warns
/// and leaves the chain fields unset. Walks at most two hops
/// (task -> feature -> epic).
pub async fn resolve(tracker: &impl BeadTracker, id: &str) -> Result<BeadContext, CapError> {
    if !tracker.available() {
        return Ok(BeadContext::minimal(id));
    }

    let task = tracker.show(id).await?;

    let mut ctx = BeadContext {
        task_id: task.id.clone(),
        task_title: task.title.clone(),
        task_description: task.description.clone(),
        acceptance_criteria: task.acceptance_criteria.clone(),
        ..Default::default()
    };

    let Some(first_hop) = task.parent_id() else {
        return Ok(ctx);
    };

    let first = match tracker.show(&first_hop).await {
        Ok(info) => info,
        Err(e) => {
            log_warn!("Warning: parent bead {} unavailable: {}", first_hop, e);
            return Ok(ctx);
        }
    };

    // A task parented directly under an epic fills the epic slots.
    if first.issue_type == BeadType::Epic {
        set_epic(&mut ctx, &first);
        return Ok(ctx);
    }

    ctx.feature_id = Some(first.id.clone());
    ctx.feature_title = Some(first.title.clone());
    ctx.feature_goal = Some(first.description.clone());

    let Some(second_hop) = first.parent_id() else {
        return Ok(ctx);
    };

    match tracker.show(&second_hop).await {
        Ok(epic) => set_epic(&mut ctx, &epic),
        Err(e) => log_warn!("Warning: parent bead {} unavailable: {}", second_hop, e),
    }

    Ok(ctx)
}

fn set_epic(ctx: &mut BeadContext, info: &BeadInfo) {
    ctx.epic_id = Some(info.id.clone());
    ctx.epic_title = Some(info.title.clone());
    ctx.epic_goal = Some(info.description.clone());
}

// --- CLI implementation ---

/// Real implementation that shells out to the `bd` CLI with `--json`.
pub struct CliBeadTracker {
    available: bool,
}

impl CliBeadTracker {
    /// Probe the tracker binary once at construction. An absent binary is
    /// not an error -- resolution degrades to minimal contexts.
    pub fn new() -> Self {
        let available = std::process::Command::new(TRACKER_BINARY)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);

        if !available {
            log_warn!(
                "Warning: `{}` not found on PATH; bead resolution degrades to IDs only",
                TRACKER_BINARY
            );
        }

        Self { available }
    }

    async fn run_tracker(&self, args: &[&str]) -> Result<String, CapError> {
        let output = tokio::process::Command::new(TRACKER_BINARY)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CapError::CliNotFound(format!("{}: {}", TRACKER_BINARY, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapError::NotFound(format!(
                "{} {} failed: {}",
                TRACKER_BINARY,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| CapError::Io(format!("{} output is not valid UTF-8: {}", TRACKER_BINARY, e)))
    }
}

impl Default for CliBeadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BeadTracker for CliBeadTracker {
    fn available(&self) -> bool {
        self.available
    }

    async fn show(&self, id: &str) -> Result<BeadInfo, CapError> {
        let stdout = self.run_tracker(&["show", id, "--json"]).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| CapError::Io(format!("Failed to parse `bd show {}` output: {}", id, e)))
    }

    async fn ready_children(&self, parent: &str) -> Result<Vec<BeadInfo>, CapError> {
        let stdout = self
            .run_tracker(&["ready", "--parent", parent, "--json"])
            .await?;
        serde_json::from_str(&stdout).map_err(|e| {
            CapError::Io(format!(
                "Failed to parse `bd ready --parent {}` output: {}",
                parent, e
            ))
        })
    }

    async fn create(&self, bead: &NewBead) -> Result<String, CapError> {
        let priority = bead.priority.to_string();
        let stdout = self
            .run_tracker(&[
                "create",
                "--parent",
                &bead.parent,
                "--priority",
                &priority,
                "--title",
                &bead.title,
                "--description",
                &bead.description,
                "--json",
            ])
            .await?;

        // Prefer a JSON `{"id": ...}` reply; fall back to bare-ID stdout.
        #[derive(Deserialize)]
        struct CreateReply {
            id: String,
        }
        match serde_json::from_str::<CreateReply>(&stdout) {
            Ok(reply) => Ok(reply.id),
            Err(_) => Ok(stdout.trim().to_string()),
        }
    }

    async fn close(&self, id: &str) -> Result<(), CapError> {
        self.run_tracker(&["close", id]).await.map(|_| ())
    }
}

// --- Mock implementation ---

/// Mock tracker for campaign and resolver tests.
///
/// Seeded with beads and parent->children orderings; records created and
/// closed beads for assertions.
pub struct MockBeadTracker {
    available: bool,
    beads: HashMap<String, BeadInfo>,
    children: HashMap<String, Vec<String>>,
    created: std::sync::Mutex<Vec<NewBead>>,
    closed: std::sync::Mutex<Vec<String>>,
}

impl MockBeadTracker {
    pub fn new() -> Self {
        Self {
            available: true,
            beads: HashMap::new(),
            children: HashMap::new(),
            created: std::sync::Mutex::new(Vec::new()),
            closed: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A tracker that reports itself unavailable (CLI off PATH).
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_bead(mut self, info: BeadInfo) -> Self {
        self.beads.insert(info.id.clone(), info);
        self
    }

    /// Register `children` as the ready children of `parent`, in order.
    pub fn with_children(mut self, parent: &str, children: &[&str]) -> Self {
        self.children.insert(
            parent.to_string(),
            children.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn created_beads(&self) -> Vec<NewBead> {
        self.created.lock().expect("created lock").clone()
    }

    pub fn closed_beads(&self) -> Vec<String> {
        self.closed.lock().expect("closed lock").clone()
    }
}

impl Default for MockBeadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BeadTracker for MockBeadTracker {
    fn available(&self) -> bool {
        self.available
    }

    async fn show(&self, id: &str) -> Result<BeadInfo, CapError> {
        self.beads
            .get(id)
            .cloned()
            .ok_or_else(|| CapError::NotFound(format!("bead {}", id)))
    }

    async fn ready_children(&self, parent: &str) -> Result<Vec<BeadInfo>, CapError> {
        let ids = self.children.get(parent).cloned().unwrap_or_default();
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            infos.push(
                self.beads
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| CapError::NotFound(format!("bead {}", id)))?,
            );
        }
        Ok(infos)
    }

    async fn create(&self, bead: &NewBead) -> Result<String, CapError> {
        let mut created = self.created.lock().expect("created lock");
        created.push(bead.clone());
        Ok(format!("{}.d{}", bead.parent, created.len()))
    }

    async fn close(&self, id: &str) -> Result<(), CapError> {
        self.closed.lock().expect("closed lock").push(id.to_string());
        Ok(())
    }
}
