use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cascade_core::context::IsolatedRoleContext;
use cascade_core::types::{
    ErrorKind, ErrorLogEntry, HandoffRecord, HandoffStatus, RoleResult, RoleStatus, TaskSpec,
    WorkflowId, WorkflowStatus,
};

/// A recovery action the engine applied to a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedRecovery {
    pub role: String,
    pub action: String,
    pub automatic: bool,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

/// Why a workflow is waiting for a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingIntervention {
    pub role: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Full execution state of one workflow. Owned by the engine; callers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: WorkflowId,
    pub task: TaskSpec,
    pub roles: Vec<String>,
    pub current_role_index: usize,
    pub status: WorkflowStatus,
    pub role_status: BTreeMap<String, RoleStatus>,
    pub results: BTreeMap<String, RoleResult>,
    pub error_log: Vec<ErrorLogEntry>,
    pub retry_counts: BTreeMap<String, u32>,
    pub recovery_actions: Vec<AppliedRecovery>,
    pub pending_intervention: Option<PendingIntervention>,
    pub contexts: BTreeMap<String, IsolatedRoleContext>,
    pub handoffs: Vec<HandoffRecord>,
    /// Index into `handoffs` of the record that seeds the current role.
    pub pending_handoff: Option<usize>,
    pub sequence_adjusted: bool,
    /// Substitute role to the role it first stood in for.
    #[serde(default)]
    pub replaced: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub total_execution_ms: u64,
}

impl WorkflowExecution {
    pub fn new(task: TaskSpec, roles: Vec<String>) -> Self {
        let role_status = roles
            .iter()
            .map(|r| (r.clone(), RoleStatus::Pending))
            .collect();
        Self {
            id: WorkflowId::new(),
            task,
            roles,
            current_role_index: 0,
            status: WorkflowStatus::Created,
            role_status,
            results: BTreeMap::new(),
            error_log: Vec::new(),
            retry_counts: BTreeMap::new(),
            recovery_actions: Vec::new(),
            pending_intervention: None,
            contexts: BTreeMap::new(),
            handoffs: Vec::new(),
            pending_handoff: None,
            sequence_adjusted: false,
            replaced: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            queued_at: None,
            total_execution_ms: 0,
        }
    }

    pub fn current_role(&self) -> Option<&str> {
        self.roles.get(self.current_role_index).map(|s| s.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.current_role_index >= self.roles.len()
    }

    pub fn progress(&self) -> String {
        format!(
            "{}/{}",
            self.current_role_index.min(self.roles.len()),
            self.roles.len()
        )
    }

    pub fn log_error(&mut self, role: Option<&str>, kind: ErrorKind, message: impl Into<String>) {
        self.error_log.push(ErrorLogEntry::new(role, kind, message));
    }

    pub fn set_role_status(&mut self, role: &str, status: RoleStatus) {
        self.role_status.insert(role.to_string(), status);
    }

    /// The role `role` stands in for, or `role` itself.
    pub fn original_of<'a>(&'a self, role: &'a str) -> &'a str {
        self.replaced.get(role).map(String::as_str).unwrap_or(role)
    }

    /// Every role already tried in the slot first held by `original`.
    pub fn tried_for<'a>(&'a self, original: &'a str) -> Vec<&'a str> {
        let mut tried = vec![original];
        tried.extend(
            self.replaced
                .iter()
                .filter(|(_, o)| o.as_str() == original)
                .map(|(r, _)| r.as_str()),
        );
        tried
    }

    /// Record `replacement` taking the slot at `index`.
    pub fn substitute(&mut self, index: usize, replacement: &str) {
        let Some(current) = self.roles.get(index) else {
            return;
        };
        let original = self.original_of(current).to_string();
        self.replaced.insert(replacement.to_string(), original);
        self.roles[index] = replacement.to_string();
        self.set_role_status(replacement, RoleStatus::Pending);
    }

    /// The handoff seeding the current role. Stays set across retries.
    pub fn pending_handoff(&self) -> Option<&HandoffRecord> {
        self.pending_handoff
            .and_then(|i| self.handoffs.get(i))
            .filter(|h| h.status != HandoffStatus::Rejected)
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            id: self.id.clone(),
            description: self.task.description.clone(),
            status: self.status,
            current_role: if self.is_finished() {
                None
            } else {
                self.current_role().map(str::to_string)
            },
            progress: self.progress(),
            priority: self.task.priority,
            errors: self.error_log.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Lightweight status view returned by status and list calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub id: WorkflowId,
    pub description: String,
    pub status: WorkflowStatus,
    pub current_role: Option<String>,
    /// `"{current_index}/{total}"`
    pub progress: String,
    pub priority: u8,
    pub errors: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_workflow() {
        let wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["a", "b", "c"]));
        assert_eq!(wf.status, WorkflowStatus::Created);
        assert_eq!(wf.progress(), "0/3");
        assert_eq!(wf.current_role(), Some("a"));
        assert!(wf.role_status.values().all(|s| *s == RoleStatus::Pending));
    }

    #[test]
    fn test_summary_when_finished() {
        let mut wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["a", "b"]));
        wf.current_role_index = 2;
        let s = wf.summary();
        assert_eq!(s.progress, "2/2");
        assert!(s.current_role.is_none());
    }

    #[test]
    fn test_substitution_lineage() {
        let mut wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["a", "c"]));
        wf.substitute(0, "b");
        wf.substitute(0, "d");
        assert_eq!(wf.roles, roles(&["d", "c"]));
        assert_eq!(wf.original_of("d"), "a");
        assert_eq!(wf.original_of("b"), "a");
        assert_eq!(wf.original_of("c"), "c");
        assert_eq!(wf.tried_for("a"), vec!["a", "b", "d"]);
        assert_eq!(wf.role_status["d"], RoleStatus::Pending);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["a"]));
        wf.log_error(Some("a"), ErrorKind::RoleExecution, "boom");
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, wf.id);
        assert_eq!(back.error_log.len(), 1);
    }
}
