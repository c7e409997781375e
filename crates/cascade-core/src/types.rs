use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique workflow identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The task a workflow works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    /// 1 (lowest) to 10 (highest). Used for admission ordering.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub requirements: Vec<String>,
}

fn default_priority() -> u8 { 5 }

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            priority: default_priority(),
            requirements: vec![],
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }
}

/// Workflow lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, Failed and Cancelled admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow status: {}", other)),
        }
    }
}

/// Per-role state within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Output of one role run, as reported by the role executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleResult {
    pub role_id: String,
    pub status: RoleStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub completeness_score: f64,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub handoff_summary: Option<String>,
    #[serde(default)]
    pub next_role_guidance: Option<String>,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl RoleResult {
    /// A successful result with no outputs yet.
    pub fn completed(role_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            status: RoleStatus::Completed,
            outputs: BTreeMap::new(),
            deliverables: vec![],
            quality_score: 1.0,
            completeness_score: 1.0,
            execution_time_ms: 0,
            handoff_summary: None,
            next_role_guidance: None,
            key_findings: vec![],
            next_steps: vec![],
            error_message: None,
            error_type: None,
        }
    }

    /// A failed result carrying an error payload.
    pub fn failed(
        role_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: RoleStatus::Failed,
            quality_score: 0.0,
            completeness_score: 0.0,
            error_message: Some(message.into()),
            error_type: Some(error_type.into()),
            ..Self::completed(role_id)
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_deliverable(mut self, deliverable: impl Into<String>) -> Self {
        self.deliverables.push(deliverable.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.handoff_summary = Some(summary.into());
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.next_role_guidance = Some(guidance.into());
        self
    }

    pub fn with_finding(mut self, finding: impl Into<String>) -> Self {
        self.key_findings.push(finding.into());
        self
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_steps.push(step.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == RoleStatus::Completed
    }
}

/// Lifecycle of a handoff record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Structured package passed from a completed role to the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub from_role: String,
    pub to_role: String,
    pub task_description: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub status: HandoffStatus,
    #[serde(default)]
    pub validation_score: f64,
}

/// Category of an error log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Admission,
    RoleExecution,
    HandoffValidation,
    System,
    RetryExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Admission => "admission",
            Self::RoleExecution => "role_execution",
            Self::HandoffValidation => "handoff_validation",
            Self::System => "system",
            Self::RetryExhausted => "retry_exhausted",
        }
    }
}

/// One entry in a workflow's append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    /// Role that failed; `None` for workflow-level errors.
    pub role: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(role: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events emitted by the workflow engine.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Workflow registered (status Created).
    Created { workflow_id: WorkflowId, roles: Vec<String> },
    /// Workflow waiting for an admission slot.
    Queued { workflow_id: WorkflowId, priority: u8 },
    /// Workflow admitted and running.
    Started { workflow_id: WorkflowId },
    /// Role execution started.
    RoleStarted { workflow_id: WorkflowId, role: String, index: usize },
    /// Role completed successfully.
    RoleCompleted { workflow_id: WorkflowId, role: String, elapsed_ms: u64 },
    /// Role failed (before recovery).
    RoleFailed { workflow_id: WorkflowId, role: String, error: String },
    /// Handoff created between two roles.
    HandoffCreated { workflow_id: WorkflowId, from: String, to: String, score: f64 },
    /// Error recovery decided on an action.
    RecoveryDecided { workflow_id: WorkflowId, role: String, action: String, automatic: bool },
    Paused { workflow_id: WorkflowId, reason: String },
    Resumed { workflow_id: WorkflowId },
    Cancelled { workflow_id: WorkflowId },
    Completed { workflow_id: WorkflowId, total_ms: u64 },
    Failed { workflow_id: WorkflowId, error: String },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Self::Created { workflow_id, .. }
            | Self::Queued { workflow_id, .. }
            | Self::Started { workflow_id }
            | Self::RoleStarted { workflow_id, .. }
            | Self::RoleCompleted { workflow_id, .. }
            | Self::RoleFailed { workflow_id, .. }
            | Self::HandoffCreated { workflow_id, .. }
            | Self::RecoveryDecided { workflow_id, .. }
            | Self::Paused { workflow_id, .. }
            | Self::Resumed { workflow_id }
            | Self::Cancelled { workflow_id }
            | Self::Completed { workflow_id, .. }
            | Self::Failed { workflow_id, .. } => workflow_id,
        }
    }

    /// Whether this event ends the workflow's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
