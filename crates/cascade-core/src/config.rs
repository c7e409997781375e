use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::RoleDefinition;
use crate::classification::{
    ErrorCategory, RecoveryApplicability, RecoveryFeasibility, Severity, WorkflowImpact,
};
use crate::error::{CascadeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_workflow_start: Vec<String>,
    #[serde(default)]
    pub on_role_start: Vec<String>,
    #[serde(default)]
    pub on_role_complete: Vec<String>,
    #[serde(default)]
    pub on_role_failed: Vec<String>,
    #[serde(default)]
    pub on_workflow_paused: Vec<String>,
    #[serde(default)]
    pub on_workflow_complete: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_workflow_start.is_empty()
            && self.on_role_start.is_empty()
            && self.on_role_complete.is_empty()
            && self.on_role_failed.is_empty()
            && self.on_workflow_paused.is_empty()
            && self.on_workflow_complete.is_empty()
    }
}

/// Top-level Cascade configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
    /// Catalog entries that override or extend the built-in roles.
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum workflows running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,
    /// Maximum workflows waiting for a slot.
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
    /// Automatic retries allowed per role before the workflow fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Reorder a sequence with dependency-order errors at creation time.
    #[serde(default = "default_true")]
    pub auto_adjust_sequence: bool,
    /// Refuse to start a workflow whose sequence has dependency errors.
    #[serde(default = "default_true")]
    pub strict_dependencies: bool,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Capacity of the per-engine execution history used for stats.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Priority for tasks submitted without one, 1 to 10.
    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent(),
            max_queue_size: default_max_queue(),
            max_retries: default_max_retries(),
            auto_adjust_sequence: true,
            strict_dependencies: true,
            workspace: default_workspace(),
            history_limit: default_history_limit(),
            default_priority: default_priority(),
        }
    }
}

fn default_max_concurrent() -> usize { 10 }
fn default_max_queue() -> usize { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_workspace() -> String { "~/.cascade".to_string() }
fn default_history_limit() -> usize { 1000 }
fn default_priority() -> u8 { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Sections below this importance are dropped on compression.
    #[serde(default = "default_retention_threshold")]
    pub retention_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            retention_threshold: default_retention_threshold(),
        }
    }
}

fn default_retention_threshold() -> f64 { 0.3 }

/// Required fields for handoffs between a specific pair of roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffTemplateConfig {
    pub from: String,
    pub to: String,
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_quality_warning")]
    pub min_quality_warning: f64,
    #[serde(default = "default_relevance_warning")]
    pub min_relevance_warning: f64,
    #[serde(default)]
    pub templates: Vec<HandoffTemplateConfig>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            min_quality_warning: default_quality_warning(),
            min_relevance_warning: default_relevance_warning(),
            templates: vec![],
        }
    }
}

fn default_quality_warning() -> f64 { 0.7 }
fn default_relevance_warning() -> f64 { 0.6 }

/// A regex classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRuleConfig {
    pub pattern: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub feasibility: RecoveryFeasibility,
    #[serde(default = "default_rule_impact")]
    pub impact: WorkflowImpact,
    pub applicability: RecoveryApplicability,
    #[serde(default = "default_rule_confidence")]
    pub confidence: f64,
}

fn default_rule_impact() -> WorkflowImpact { WorkflowImpact::BlocksDependent }
fn default_rule_confidence() -> f64 { 0.8 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Minimum capability similarity for a replacement role.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_max_strategies")]
    pub max_strategies: usize,
    /// Classifier answers below this confidence count as "no opinion".
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Consult the LLM classifier when pattern rules have no opinion.
    #[serde(default)]
    pub llm_enabled: bool,
    /// Rules checked before the built-in ones.
    #[serde(default)]
    pub rules: Vec<PatternRuleConfig>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            max_strategies: default_max_strategies(),
            min_confidence: default_min_confidence(),
            llm_enabled: false,
            rules: vec![],
        }
    }
}

fn default_similarity_threshold() -> f64 { 0.6 }
fn default_max_strategies() -> usize { 5 }
fn default_min_confidence() -> f64 { 0.6 }

/// Shell command used to run roles from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

fn default_executor_timeout() -> u64 { 600 }

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Database path. Relative paths resolve against the workspace.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_path() -> String { "checkpoints.db".to_string() }

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative paths resolve against the workspace.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = lifecycle, 2 = per-role, 3 = recovery detail.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CascadeError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| CascadeError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_concurrent_workflows == 0 {
            return Err(CascadeError::Config(
                "engine.max_concurrent_workflows must be at least 1".to_string(),
            ));
        }
        if !(1..=10).contains(&self.engine.default_priority) {
            return Err(CascadeError::Config(format!(
                "engine.default_priority must be 1 to 10, got {}",
                self.engine.default_priority
            )));
        }
        if !(0.0..=1.0).contains(&self.context.retention_threshold) {
            return Err(CascadeError::Config(format!(
                "context.retention_threshold out of range: {}",
                self.context.retention_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.recovery.similarity_threshold) {
            return Err(CascadeError::Config(format!(
                "recovery.similarity_threshold out of range: {}",
                self.recovery.similarity_threshold
            )));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Checkpoint database path, if checkpointing is enabled.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        let cp = self.checkpoint.as_ref()?;
        if !cp.enabled {
            return None;
        }
        Some(self.resolve(&cp.path))
    }

    /// Run log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref()?;
        if !log.enabled {
            return None;
        }
        Some(self.resolve(&log.log_dir))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = expand_home(path);
        if p.is_absolute() {
            p
        } else {
            self.workspace_dir().join(p)
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
