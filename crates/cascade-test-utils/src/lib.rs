//! Mocks and fixtures shared by the Cascade test suites.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use cascade_core::catalog::{RoleCatalog, RoleDefinition};
use cascade_core::context::IsolatedRoleContext;
use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::{LlmClient, RoleExecutor};
use cascade_core::types::RoleResult;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a scripted role returns on one call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success(RoleResult),
    /// A result with failed status.
    Failure { message: String },
    /// The executor itself errors.
    Error(String),
}

impl ScriptedOutcome {
    pub fn success(result: RoleResult) -> Self {
        Self::Success(result)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Result that passes the generic handoff template.
pub fn default_result(role: &str) -> RoleResult {
    RoleResult::completed(role)
        .with_summary(format!("{} finished its part of the task", role))
        .with_finding(format!("{} found nothing unexpected", role))
        .with_next_step("continue with the next role")
}

/// Lets a test observe and release a role that is mid-execution.
#[derive(Clone, Default)]
pub struct RoleGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl RoleGate {
    /// Resolves once the held role has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Role executor driven by per-role queues of outcomes.
///
/// Roles with nothing queued succeed with [`default_result`].
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    holds: Mutex<HashMap<String, RoleGate>>,
    calls: Mutex<Vec<(String, IsolatedRoleContext)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, role: &str, outcome: ScriptedOutcome) -> Self {
        self.push(role, outcome);
        self
    }

    pub fn push(&self, role: &str, outcome: ScriptedOutcome) {
        lock(&self.scripts)
            .entry(role.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Block the next call of `role` until the gate is released.
    pub fn hold(&self, role: &str) -> RoleGate {
        let gate = RoleGate::default();
        lock(&self.holds).insert(role.to_string(), gate.clone());
        gate
    }

    /// Roles in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|(r, _)| r.clone()).collect()
    }

    /// Contexts in call order.
    pub fn contexts(&self) -> Vec<IsolatedRoleContext> {
        lock(&self.calls).iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn call_count(&self, role: &str) -> usize {
        lock(&self.calls).iter().filter(|(r, _)| r == role).count()
    }
}

impl RoleExecutor for ScriptedExecutor {
    fn execute(
        &self,
        role: String,
        context: IsolatedRoleContext,
    ) -> BoxFuture<'_, Result<RoleResult>> {
        Box::pin(async move {
            lock(&self.calls).push((role.clone(), context));

            let gate = lock(&self.holds).remove(&role);
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            let outcome = lock(&self.scripts)
                .get_mut(&role)
                .and_then(|q| q.pop_front());
            match outcome {
                Some(ScriptedOutcome::Success(result)) => Ok(result),
                Some(ScriptedOutcome::Failure { message }) => {
                    Ok(RoleResult::failed(role, "scripted", message))
                }
                Some(ScriptedOutcome::Error(message)) => {
                    Err(CascadeError::RoleExecution { role, message })
                }
                None => Ok(default_result(&role)),
            }
        })
    }
}

/// LLM client that replays queued responses and records prompts.
#[derive(Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, response: impl Into<String>) -> Self {
        lock(&self.responses).push_back(Ok(response.into()));
        self
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        lock(&self.responses).push_back(Err(message.into()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            lock(&self.prompts).push(prompt);
            match lock(&self.responses).pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(CascadeError::LlmRequest(message)),
                None => Err(CascadeError::LlmRequest("no scripted response".to_string())),
            }
        })
    }
}

/// Small catalog with disjoint capabilities.
///
/// `reader` → `analyst` → `writer` are chained by strong dependencies.
/// `backup_analyst` shares the analyst's capability. `illustrator` and
/// `archivist` stand alone.
pub fn sample_catalog() -> RoleCatalog {
    let analyst_like = |id: &str| {
        RoleDefinition::new(id)
            .with_domains(&["analysis"])
            .with_sub_domains(&["statistics", "modeling"])
            .with_output_types(&["report"])
            .with_strong(&["reader"])
            .with_keywords(&["finding", "data"])
    };
    RoleCatalog::new(vec![
        RoleDefinition::new("reader")
            .with_domains(&["research"])
            .with_sub_domains(&["reading"])
            .with_output_types(&["notes"]),
        analyst_like("analyst"),
        RoleDefinition::new("writer")
            .with_domains(&["writing"])
            .with_sub_domains(&["drafting"])
            .with_output_types(&["document"])
            .with_strong(&["analyst"]),
        RoleDefinition::new("illustrator")
            .with_domains(&["design"])
            .with_sub_domains(&["drawing"])
            .with_output_types(&["images"]),
        RoleDefinition::new("archivist")
            .with_domains(&["records"])
            .with_sub_domains(&["filing"])
            .with_output_types(&["index"]),
        analyst_like("backup_analyst"),
    ])
}

/// The built-in software development roles.
pub fn software_catalog() -> RoleCatalog {
    RoleCatalog::builtin()
}

/// Fresh database path under the system temp dir.
pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("cascade_test_{}", uuid::Uuid::new_v4()))
        .join("cascade.db")
}
