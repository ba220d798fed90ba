use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// --- Resolved configuration ---

/// Fully resolved configuration after layer merging.
///
/// Layers, lowest to highest precedence: built-in defaults -> user config
/// file -> project config file -> environment overrides. Merges are
/// field-level -- an override at one layer does not erase unset siblings.
#[derive(Clone, Debug, PartialEq)]
pub struct CapsuleConfig {
    pub runtime: RuntimeConfig,
    pub worktree: WorktreeConfig,
    pub pipeline: PipelineConfig,
    pub campaign: CampaignConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Default completion provider name (key into `providers`).
    pub provider: String,
    /// Default per-phase timeout.
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorktreeConfig {
    /// Workspace base directory, relative to the repository root.
    pub base_dir: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Named phase set (`"default"`) or a path to a custom definition file.
    pub phases: String,
    /// Enable per-phase checkpointing.
    pub checkpoint: bool,
    pub retry: RetryConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Per writer/reviewer pair attempt cap.
    pub max_attempts: u32,
    /// Timeout multiplier per retry. 0 disables; (0, 1) is rejected at
    /// validation -- shrinking a timeout on retry contradicts the intent.
    pub backoff_factor: f64,
    pub escalate_provider: Option<String>,
    /// Attempt index after which to switch to the escalation provider.
    pub escalate_after: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    Abort,
    Continue,
}

pub fn parse_failure_mode(s: &str) -> Result<FailureMode, String> {
    match s.to_lowercase().as_str() {
        "abort" => Ok(FailureMode::Abort),
        "continue" => Ok(FailureMode::Continue),
        _ => Err(format!(
            "Invalid failure mode '{}': expected abort or continue",
            s
        )),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CampaignConfig {
    pub failure_mode: FailureMode,
    /// Consecutive-failure cap; 0 means the breaker never trips.
    pub circuit_breaker: u32,
    /// File reviewer findings as new child beads.
    pub discovery_filing: bool,
    /// Include prior siblings' summaries in task prompts.
    pub cross_run_context: bool,
    /// Phase names to run against the parent after all children complete.
    pub validation_phases: Vec<String>,
    /// Recursion depth cap for epic -> feature -> task.
    pub max_depth: u32,
}

// --- Provider table ---

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            CliTool::Claude => "Claude CLI",
            CliTool::OpenCode => "OpenCode CLI",
        }
    }

    pub fn build_args(&self, prompt: &str, model: Option<&str>) -> Vec<String> {
        match self {
            CliTool::Claude => {
                let mut args = vec!["--dangerously-skip-permissions".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("-p".to_string());
                args.push(prompt.to_string());
                args
            }
            CliTool::OpenCode => {
                let mut args = vec!["run".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("--quiet".to_string());
                args.push(prompt.to_string());
                args
            }
        }
    }

    pub fn version_args(&self) -> Vec<&str> {
        match self {
            CliTool::Claude => vec!["--version"],
            CliTool::OpenCode => vec!["--version"],
        }
    }

    pub fn install_hint(&self) -> &str {
        match self {
            CliTool::Claude => "Install: https://docs.anthropic.com/en/docs/claude-code",
            CliTool::OpenCode => "Install: https://github.com/opencode-ai/opencode",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    pub tool: CliTool,
    pub model: Option<String>,
}

// --- Raw layers ---

/// One configuration layer as read from a file or the environment.
/// Every field is optional; unset fields fall through to lower layers.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub runtime: RuntimeLayer,
    pub worktree: WorktreeLayer,
    pub pipeline: PipelineLayer,
    pub campaign: CampaignLayer,
    pub providers: HashMap<String, ProviderLayer>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeLayer {
    pub provider: Option<String>,
    /// Duration: integer seconds or an `s`/`m`/`h` suffixed value.
    pub timeout: Option<String>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorktreeLayer {
    pub base_dir: Option<String>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineLayer {
    pub phases: Option<String>,
    pub checkpoint: Option<bool>,
    pub retry: RetryLayer,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryLayer {
    pub max_attempts: Option<u32>,
    pub backoff_factor: Option<f64>,
    pub escalate_provider: Option<String>,
    pub escalate_after: Option<u32>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignLayer {
    pub failure_mode: Option<String>,
    pub circuit_breaker: Option<u32>,
    pub discovery_filing: Option<bool>,
    pub cross_run_context: Option<bool>,
    pub validation_phases: Option<Vec<String>>,
    pub max_depth: Option<u32>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderLayer {
    pub tool: Option<CliTool>,
    pub model: Option<String>,
}

impl ConfigLayer {
    /// Merge `higher` over `self`, field by field. Set-in-layer wins;
    /// unset leaves the lower layer's value in place.
    pub fn merge(&mut self, higher: ConfigLayer) {
        merge_opt(&mut self.runtime.provider, higher.runtime.provider);
        merge_opt(&mut self.runtime.timeout, higher.runtime.timeout);
        merge_opt(&mut self.worktree.base_dir, higher.worktree.base_dir);
        merge_opt(&mut self.pipeline.phases, higher.pipeline.phases);
        merge_opt(&mut self.pipeline.checkpoint, higher.pipeline.checkpoint);
        merge_opt(
            &mut self.pipeline.retry.max_attempts,
            higher.pipeline.retry.max_attempts,
        );
        merge_opt(
            &mut self.pipeline.retry.backoff_factor,
            higher.pipeline.retry.backoff_factor,
        );
        merge_opt(
            &mut self.pipeline.retry.escalate_provider,
            higher.pipeline.retry.escalate_provider,
        );
        merge_opt(
            &mut self.pipeline.retry.escalate_after,
            higher.pipeline.retry.escalate_after,
        );
        merge_opt(&mut self.campaign.failure_mode, higher.campaign.failure_mode);
        merge_opt(
            &mut self.campaign.circuit_breaker,
            higher.campaign.circuit_breaker,
        );
        merge_opt(
            &mut self.campaign.discovery_filing,
            higher.campaign.discovery_filing,
        );
        merge_opt(
            &mut self.campaign.cross_run_context,
            higher.campaign.cross_run_context,
        );
        merge_opt(
            &mut self.campaign.validation_phases,
            higher.campaign.validation_phases,
        );
        merge_opt(&mut self.campaign.max_depth, higher.campaign.max_depth);

        for (name, provider) in higher.providers {
            let entry = self.providers.entry(name).or_default();
            merge_opt(&mut entry.tool, provider.tool);
            merge_opt(&mut entry.model, provider.model);
        }
    }
}

fn merge_opt<T>(lower: &mut Option<T>, higher: Option<T>) {
    if higher.is_some() {
        *lower = higher;
    }
}

// --- Duration parsing ---

/// Parse a duration string: plain integer seconds, or `s`/`m`/`h` suffixed.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration".to_string());
    }

    let (number, multiplier) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1u64),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid duration '{}': expected seconds or Ns/Nm/Nh", s))?;

    Ok(Duration::from_secs(value * multiplier))
}

// --- Loading ---

const PROJECT_CONFIG_NAME: &str = "capsule.toml";

/// Path of the user-level config file, `{config_dir}/capsule/config.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("capsule").join("config.toml"))
}

/// Load the full layered configuration.
///
/// `explicit` overrides the project config path and MUST exist when given;
/// the default `{root}/capsule.toml` is optional. The user layer at
/// `user_config_path()` is optional. Environment overrides
/// (`CAPSULE_PROVIDER`, `CAPSULE_TIMEOUT`, `CAPSULE_WORKTREE_BASE_DIR`)
/// apply last.
pub fn load(project_root: &Path, explicit: Option<&Path>) -> Result<CapsuleConfig, String> {
    let mut merged = ConfigLayer::default();

    if let Some(user_path) = user_config_path() {
        if user_path.exists() {
            merged.merge(read_layer(&user_path)?);
        }
    }

    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            merged.merge(read_layer(path)?);
        }
        None => {
            let default_path = project_root.join(PROJECT_CONFIG_NAME);
            if default_path.exists() {
                merged.merge(read_layer(&default_path)?);
            }
        }
    }

    merged.merge(env_layer());

    let config = finalize(merged)?;
    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

fn read_layer(path: &Path) -> Result<ConfigLayer, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    toml::from_str(&contents).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
}

/// Build the environment-override layer.
pub fn env_layer() -> ConfigLayer {
    let mut layer = ConfigLayer::default();
    if let Ok(provider) = std::env::var("CAPSULE_PROVIDER") {
        layer.runtime.provider = Some(provider);
    }
    if let Ok(timeout) = std::env::var("CAPSULE_TIMEOUT") {
        layer.runtime.timeout = Some(timeout);
    }
    if let Ok(base_dir) = std::env::var("CAPSULE_WORKTREE_BASE_DIR") {
        layer.worktree.base_dir = Some(base_dir);
    }
    layer
}

/// Apply built-in defaults to every field still unset after merging.
pub fn finalize(layer: ConfigLayer) -> Result<CapsuleConfig, String> {
    let timeout = match layer.runtime.timeout {
        Some(ref s) => parse_duration(s)?,
        None => Duration::from_secs(30 * 60),
    };

    let failure_mode = match layer.campaign.failure_mode {
        Some(ref s) => parse_failure_mode(s)?,
        None => FailureMode::Abort,
    };

    let mut providers: HashMap<String, ProviderConfig> = layer
        .providers
        .into_iter()
        .map(|(name, p)| {
            (
                name,
                ProviderConfig {
                    tool: p.tool.unwrap_or_default(),
                    model: p.model.and_then(normalize_model),
                },
            )
        })
        .collect();

    // The default provider always exists so a bare config runs.
    providers.entry("claude".to_string()).or_insert(ProviderConfig {
        tool: CliTool::Claude,
        model: None,
    });

    Ok(CapsuleConfig {
        runtime: RuntimeConfig {
            provider: layer.runtime.provider.unwrap_or_else(|| "claude".to_string()),
            timeout,
        },
        worktree: WorktreeConfig {
            base_dir: layer
                .worktree
                .base_dir
                .unwrap_or_else(|| ".capsule".to_string()),
        },
        pipeline: PipelineConfig {
            phases: layer.pipeline.phases.unwrap_or_else(|| "default".to_string()),
            checkpoint: layer.pipeline.checkpoint.unwrap_or(true),
            retry: RetryConfig {
                max_attempts: layer.pipeline.retry.max_attempts.unwrap_or(3),
                backoff_factor: layer.pipeline.retry.backoff_factor.unwrap_or(0.0),
                escalate_provider: layer.pipeline.retry.escalate_provider,
                escalate_after: layer.pipeline.retry.escalate_after,
            },
        },
        campaign: CampaignConfig {
            failure_mode,
            circuit_breaker: layer.campaign.circuit_breaker.unwrap_or(3),
            discovery_filing: layer.campaign.discovery_filing.unwrap_or(false),
            cross_run_context: layer.campaign.cross_run_context.unwrap_or(true),
            validation_phases: layer.campaign.validation_phases.unwrap_or_default(),
            max_depth: layer.campaign.max_depth.unwrap_or(3),
        },
        providers,
    })
}

fn normalize_model(model: String) -> Option<String> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// --- Validation ---

pub fn validate(config: &CapsuleConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !config.providers.contains_key(&config.runtime.provider) {
        errors.push(format!(
            "runtime.provider '{}' is not defined in [providers]",
            config.runtime.provider
        ));
    }

    if config.runtime.timeout.is_zero() {
        errors.push("runtime.timeout must be greater than zero".to_string());
    }

    if config.pipeline.retry.max_attempts < 1 {
        errors.push("pipeline.retry.max_attempts must be >= 1".to_string());
    }

    let factor = config.pipeline.retry.backoff_factor;
    if factor < 0.0 {
        errors.push("pipeline.retry.backoff_factor must not be negative".to_string());
    } else if factor > 0.0 && factor < 1.0 {
        errors.push(
            "pipeline.retry.backoff_factor in (0, 1) is rejected: shrinking a timeout on retry contradicts the intent (use 0 to disable)"
                .to_string(),
        );
    }

    if let Some(ref escalate) = config.pipeline.retry.escalate_provider {
        if !config.providers.contains_key(escalate) {
            errors.push(format!(
                "pipeline.retry.escalate_provider '{}' is not defined in [providers]",
                escalate
            ));
        }
        if config.pipeline.retry.escalate_after.is_none() {
            errors.push(
                "pipeline.retry.escalate_provider requires pipeline.retry.escalate_after"
                    .to_string(),
            );
        }
    }

    if config.campaign.max_depth < 1 {
        errors.push("campaign.max_depth must be >= 1".to_string());
    }

    for (name, provider) in &config.providers {
        if let Some(ref model) = provider.model {
            let is_valid = !model.is_empty()
                && model
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
            if !is_valid {
                errors.push(format!(
                    "providers.{}.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')",
                    name
                ));
            } else if model.starts_with('-') {
                errors.push(format!(
                    "providers.{}.model must not start with '-' (flag-like values are rejected)",
                    name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_bare_seconds_and_suffixes() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn defaults_validate() {
        let config = finalize(ConfigLayer::default()).unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.runtime.provider, "claude");
        assert_eq!(config.pipeline.retry.max_attempts, 3);
        assert_eq!(config.campaign.max_depth, 3);
    }

    #[test]
    fn backoff_factor_below_one_rejected() {
        let mut config = finalize(ConfigLayer::default()).unwrap();
        config.pipeline.retry.backoff_factor = 0.5;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("backoff_factor")));
    }

    #[test]
    fn backoff_factor_zero_and_above_one_accepted() {
        let mut config = finalize(ConfigLayer::default()).unwrap();
        config.pipeline.retry.backoff_factor = 0.0;
        assert!(validate(&config).is_ok());
        config.pipeline.retry.backoff_factor = 1.5;
        assert!(validate(&config).is_ok());
    }
}
