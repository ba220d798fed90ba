use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use capsule::bead::{BeadTracker, CliBeadTracker};
use capsule::campaign::{
    CampaignObserver, CampaignRunner, NoConflictResolver, TaskLifecycle, TaskPipeline,
};
use capsule::cap_error::CapError;
use capsule::config::{self, CapsuleConfig};
use capsule::driver::BeadPipelineDriver;
use capsule::lifecycle;
use capsule::lock;
use capsule::log::LogLevel;
use capsule::pipeline::{self, PipelineInput, PipelineStatus};
use capsule::preflight;
use capsule::provider::CliCompletionRunner;
use capsule::state::{CampaignStatus, StateStore, TaskStatus};
use capsule::workspace::WorkspaceManager;
use capsule::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(name = "capsule", about = "Test-driven AI pipeline orchestrator")]
struct Cli {
    /// Repository root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/capsule.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a single bead, then merge and clean up
    Run {
        /// Bead ID to run
        bead_id: String,
    },
    /// Run a campaign over a parent bead's ready children
    Campaign {
        /// Parent bead ID (epic or feature)
        parent_id: String,
    },
    /// Show the persisted state of a campaign
    Status {
        /// Parent bead ID
        parent_id: String,
    },
    /// Manage per-bead workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List active workspaces
    List,
    /// Force-remove a workspace
    Remove {
        /// Bead ID of the workspace
        id: String,
        /// Keep the capsule-{id} branch
        #[arg(long)]
        keep_branch: bool,
    },
    /// Garbage-collect stale workspace registrations
    Prune,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_level.parse::<LogLevel>() {
        Ok(level) => capsule::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }

    let root = cli.root.clone();

    let result = match cli.command {
        Commands::Run { bead_id } => handle_run(&root, cli.config.as_deref(), &bead_id).await,
        Commands::Campaign { parent_id } => {
            handle_campaign(&root, cli.config.as_deref(), &parent_id).await
        }
        Commands::Status { parent_id } => handle_status(&root, cli.config.as_deref(), &parent_id),
        Commands::Workspace { command } => {
            handle_workspace(&root, cli.config.as_deref(), command)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log_error!("Error: {}", e);
            let code = if e.is_setup_error() {
                2
            } else if e.is_pause() {
                0
            } else {
                1
            };
            std::process::exit(code);
        }
    }
}

// --- Shared wiring ---

struct Env {
    config: CapsuleConfig,
    base_path: PathBuf,
    workspaces: WorkspaceManager,
}

fn load_env(root: &Path, config_path: Option<&Path>) -> Result<Env, CapError> {
    let config = config::load(root, config_path).map_err(CapError::Config)?;
    let base_path = root.join(&config.worktree.base_dir);
    let workspaces = WorkspaceManager::new(root, &base_path.join("worktrees"));
    Ok(Env {
        config,
        base_path,
        workspaces,
    })
}

/// Cancel the token when SIGINT or SIGTERM lands. The in-flight completion
/// subprocess watches the same token and tears its process group down, so
/// one cancellation path covers everything.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log_warn!("Warning: failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }

        log_warn!("Shutdown requested; stopping after the current phase");
        cancel.cancel();
    });
}

// --- Lifecycle hook over the workspace manager ---

struct MergeLifecycle<'a, T: BeadTracker> {
    workspaces: &'a WorkspaceManager,
    tracker: &'a T,
    logs_base: PathBuf,
}

impl<T: BeadTracker> TaskLifecycle for MergeLifecycle<'_, T> {
    async fn after_task(&self, bead_id: &str, title: &str) -> Result<(), CapError> {
        lifecycle::post_task(self.workspaces, self.tracker, bead_id, title, &self.logs_base)
            .await
            .map(|_| ())
    }
}

// --- Observer that narrates campaign progress ---

struct LogObserver;

impl CampaignObserver for LogObserver {
    fn on_campaign_started(&self, parent_id: &str, depth: u32, total_tasks: usize) {
        log_info!(
            "[{}] Campaign started ({} tasks, depth {})",
            parent_id,
            total_tasks,
            depth
        );
    }

    fn on_task_started(&self, bead_id: &str, idx: usize, total: usize, _depth: u32) {
        log_info!("[{}] Task {}/{} started", bead_id, idx + 1, total);
    }

    fn on_task_finished(&self, bead_id: &str, status: TaskStatus, _depth: u32) {
        log_info!("[{}] Task finished: {:?}", bead_id, status);
    }

    fn on_campaign_finished(&self, parent_id: &str, status: CampaignStatus, depth: u32) {
        log_info!(
            "[{}] Campaign finished: {:?} (depth {})",
            parent_id,
            status,
            depth
        );
    }

    fn on_validation_result(&self, parent_id: &str, passed: bool) {
        log_info!("[{}] Validation {}", parent_id, if passed { "passed" } else { "failed" });
    }
}

// --- Handlers ---

async fn handle_run(root: &Path, config_path: Option<&Path>, bead_id: &str) -> Result<i32, CapError> {
    let env = load_env(root, config_path)?;
    preflight::check(root, &env.config)?;

    let _lock = lock::acquire(&env.base_path, &format!("run {}", bead_id))?;

    let phases = pipeline::load_phases(&env.config, root)?;
    let tracker = CliBeadTracker::new();
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());
    let runner = CliCompletionRunner::new(env.config.providers.clone(), cancel.clone());

    let driver = BeadPipelineDriver {
        config: &env.config,
        phases: &phases,
        runner: &runner,
        tracker: &tracker,
        workspaces: &env.workspaces,
        project_root: root,
        base_path: env.base_path.clone(),
        cancel: &cancel,
    };

    let input = PipelineInput {
        bead_id: bead_id.to_string(),
        ..Default::default()
    };

    let title = capsule::bead::resolve(&tracker, bead_id)
        .await
        .map(|ctx| ctx.task_title)
        .unwrap_or_default();

    let output = driver.run_task(&input).await?;

    match output.final_status {
        PipelineStatus::Completed => {
            let report = lifecycle::post_task(
                &env.workspaces,
                &tracker,
                bead_id,
                &title,
                &env.base_path.join("logs"),
            )
            .await?;
            if report.merged {
                log_info!("[{}] Pipeline completed and merged", bead_id);
            } else {
                log_warn!("[{}] Pipeline completed; merge did not land", bead_id);
            }
            Ok(0)
        }
        PipelineStatus::Paused => {
            log_info!("[{}] Pipeline paused; re-run to resume", bead_id);
            Ok(0)
        }
        PipelineStatus::Failed => {
            log_error!(
                "[{}] Pipeline failed: {}",
                bead_id,
                output.failure.as_deref().unwrap_or("unknown")
            );
            log_info!("[{}] Workspace preserved for inspection", bead_id);
            Ok(1)
        }
    }
}

async fn handle_campaign(
    root: &Path,
    config_path: Option<&Path>,
    parent_id: &str,
) -> Result<i32, CapError> {
    let env = load_env(root, config_path)?;
    preflight::check(root, &env.config)?;

    let _lock = lock::acquire(&env.base_path, &format!("campaign {}", parent_id))?;

    let phases = pipeline::load_phases(&env.config, root)?;
    let tracker = CliBeadTracker::new();
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());
    let runner = CliCompletionRunner::new(env.config.providers.clone(), cancel.clone());

    let driver = BeadPipelineDriver {
        config: &env.config,
        phases: &phases,
        runner: &runner,
        tracker: &tracker,
        workspaces: &env.workspaces,
        project_root: root,
        base_path: env.base_path.clone(),
        cancel: &cancel,
    };

    let post_task = MergeLifecycle {
        workspaces: &env.workspaces,
        tracker: &tracker,
        logs_base: env.base_path.join("logs"),
    };

    let store = StateStore::new(&env.base_path.join("campaigns"));
    let observer = LogObserver;

    let campaign = CampaignRunner {
        config: &env.config.campaign,
        pipeline: &driver,
        tracker: &tracker,
        post_task: &post_task,
        conflict_resolver: None::<&NoConflictResolver>,
        observer: &observer,
        store: &store,
        cancel: &cancel,
    };

    let state = campaign.run(parent_id).await?;
    match state.status {
        CampaignStatus::Completed => Ok(0),
        _ => Ok(1),
    }
}

fn handle_status(root: &Path, config_path: Option<&Path>, parent_id: &str) -> Result<i32, CapError> {
    let env = load_env(root, config_path)?;
    let store = StateStore::new(&env.base_path.join("campaigns"));

    let Some(state) = store.load(parent_id)? else {
        println!("No campaign state for {}", parent_id);
        return Ok(0);
    };

    println!("Campaign {} — {:?}", state.id, state.status);
    println!("Started: {}", state.started_at);
    println!(
        "Progress: {}/{} (consecutive failures: {})",
        state.current_task_idx,
        state.tasks.len(),
        state.consecutive_failures
    );
    for task in &state.tasks {
        let error = task
            .error
            .as_deref()
            .map(|e| format!(" — {}", e))
            .unwrap_or_default();
        println!("  {:<12} {:?}{}", task.bead_id, task.status, error);
    }

    Ok(0)
}

fn handle_workspace(
    root: &Path,
    config_path: Option<&Path>,
    command: WorkspaceCommands,
) -> Result<i32, CapError> {
    let env = load_env(root, config_path)?;
    preflight::is_git_repo(root)?;

    match command {
        WorkspaceCommands::List => {
            for id in env.workspaces.list()? {
                println!("{}", id);
            }
            Ok(0)
        }
        WorkspaceCommands::Remove { id, keep_branch } => {
            env.workspaces.remove(&id, !keep_branch)?;
            log_info!("Removed workspace {}", id);
            Ok(0)
        }
        WorkspaceCommands::Prune => {
            env.workspaces.prune()?;
            Ok(0)
        }
    }
}
