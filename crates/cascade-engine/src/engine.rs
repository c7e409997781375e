use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use cascade_core::catalog::RoleCatalog;
use cascade_core::config::{AppConfig, EngineConfig, HooksConfig};
use cascade_core::context::{IsolatedRoleContext, Section};
use cascade_core::error::{CascadeError, Result};
use cascade_core::event::EventBus;
use cascade_core::hooks::{run_hooks, HookContext};
use cascade_core::traits::{LlmClient, RoleExecutor};
use cascade_core::types::{
    ErrorKind, HandoffStatus, RoleResult, RoleStatus, TaskSpec, WorkflowEvent, WorkflowId,
    WorkflowStatus,
};

use crate::admission::AdmissionQueue;
use crate::checkpoint::CheckpointStore;
use crate::context::{ContextEngine, INTENT_WEIGHT, PRIMARY_WEIGHT};
use crate::dependency::{DependencyAnalyzer, DependencyIssue};
use crate::handoff::HandoffOrchestrator;
use crate::parallel::join_ordered;
use crate::recovery::{ErrorRecoveryController, FailureReport, RecoveryAction, RecoveryDecision};
use crate::workflow::{AppliedRecovery, PendingIntervention, StatusSummary, WorkflowExecution};

/// Importance of previous-attempt errors in a retried role's context.
const RETRY_NOTE_WEIGHT: f64 = 0.6;

/// A finished workflow, kept for stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub execution_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub registered: usize,
    pub running: usize,
    pub paused: usize,
    pub queued: usize,
    /// Finished workflows in the bounded history.
    pub total_executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_execution_ms: f64,
}

#[derive(Clone, Copy)]
enum Hook {
    WorkflowStart,
    RoleStart,
    RoleComplete,
    RoleFailed,
    WorkflowPaused,
    WorkflowComplete,
}

enum Admission {
    Run,
    Queued,
}

enum Step {
    Run {
        role: String,
        index: usize,
        context: IsolatedRoleContext,
    },
    Finished(WorkflowExecution),
    Halt,
}

struct EngineState {
    workflows: HashMap<WorkflowId, WorkflowExecution>,
    /// Workflows whose loop currently holds a slot.
    active: HashSet<WorkflowId>,
    queue: AdmissionQueue,
    history: Vec<ExecutionRecord>,
}

/// Runs role sequences in strict order, one isolated context per role,
/// with handoffs between roles and error recovery on failure.
///
/// Methods that may spawn a workflow loop take `self: &Arc<Self>`.
pub struct WorkflowEngine {
    analyzer: Arc<DependencyAnalyzer>,
    contexts: ContextEngine,
    handoffs: HandoffOrchestrator,
    recovery: ErrorRecoveryController,
    executor: Arc<dyn RoleExecutor>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    changed: Notify,
    event_bus: Option<Arc<EventBus>>,
    hooks: Option<HooksConfig>,
    checkpoints: Option<Arc<CheckpointStore>>,
}

impl WorkflowEngine {
    /// Engine with default settings.
    pub fn new(catalog: Arc<RoleCatalog>, executor: Arc<dyn RoleExecutor>) -> Self {
        let config = EngineConfig::default();
        let queue = AdmissionQueue::new(config.max_queue_size);
        Self {
            analyzer: Arc::new(DependencyAnalyzer::new(catalog.clone())),
            contexts: ContextEngine::default(),
            handoffs: HandoffOrchestrator::new().with_catalog(catalog),
            recovery: ErrorRecoveryController::new(),
            executor,
            config,
            state: Mutex::new(EngineState {
                workflows: HashMap::new(),
                active: HashSet::new(),
                queue,
                history: Vec::new(),
            }),
            changed: Notify::new(),
            event_bus: None,
            hooks: None,
            checkpoints: None,
        }
    }

    /// Wire every component from config. Checkpoints and the event bus are
    /// attached separately.
    pub fn from_config(
        config: &AppConfig,
        catalog: Arc<RoleCatalog>,
        executor: Arc<dyn RoleExecutor>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let analyzer = DependencyAnalyzer::new(catalog.clone())
            .with_similarity_threshold(config.recovery.similarity_threshold);
        let handoffs = HandoffOrchestrator::from_config(&config.handoff).with_catalog(catalog.clone());
        let recovery = ErrorRecoveryController::from_config(&config.recovery, llm)?;

        let mut engine = Self::new(catalog, executor)
            .with_config(config.engine.clone())
            .with_analyzer(Arc::new(analyzer))
            .with_context_engine(ContextEngine::new(config.context.retention_threshold))
            .with_handoff_orchestrator(handoffs)
            .with_recovery(recovery);
        if let Some(hooks) = config.hooks.clone().filter(|h| !h.is_empty()) {
            engine = engine.with_hooks(hooks);
        }
        Ok(engine)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.lock_state().queue = AdmissionQueue::new(config.max_queue_size);
        self.config = config;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<DependencyAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_context_engine(mut self, contexts: ContextEngine) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_handoff_orchestrator(mut self, handoffs: HandoffOrchestrator) -> Self {
        self.handoffs = handoffs;
        self
    }

    pub fn with_recovery(mut self, recovery: ErrorRecoveryController) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_hooks(mut self, hooks: HooksConfig) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn analyzer(&self) -> &Arc<DependencyAnalyzer> {
        &self.analyzer
    }

    pub fn recovery(&self) -> &ErrorRecoveryController {
        &self.recovery
    }

    pub fn context_engine(&self) -> &ContextEngine {
        &self.contexts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Caller API ---------------------------------------------------------

    /// Register a workflow in `Created`. A sequence whose only problems are
    /// ordering errors is reordered once when auto-adjust is on.
    pub fn create_workflow(&self, task: TaskSpec, roles: Vec<String>) -> Result<WorkflowExecution> {
        if roles.is_empty() {
            return Err(CascadeError::Validation("role sequence is empty".to_string()));
        }

        let mut wf = WorkflowExecution::new(task, roles);
        if self.config.auto_adjust_sequence {
            let validation = self.analyzer.validate_sequence(&wf.roles);
            if validation.only_order_errors() {
                let adjusted = self.analyzer.adjust_sequence(&wf.roles);
                info!(
                    workflow_id = %wf.id,
                    from = ?wf.roles,
                    to = ?adjusted,
                    "Adjusted role sequence"
                );
                wf.roles = adjusted;
                wf.sequence_adjusted = true;
            }
        }

        let snapshot = wf.clone();
        self.lock_state().workflows.insert(wf.id.clone(), wf);
        info!(workflow_id = %snapshot.id, roles = ?snapshot.roles, "Workflow created");
        self.emit(WorkflowEvent::Created {
            workflow_id: snapshot.id.clone(),
            roles: snapshot.roles.clone(),
        });
        self.save_checkpoint(&snapshot);
        Ok(snapshot)
    }

    /// Validate and start in the background, or enqueue when the engine is
    /// full. False if the workflow is not startable or was rejected.
    pub fn start(self: &Arc<Self>, id: &WorkflowId) -> bool {
        let admitted = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(wf) = state.workflows.get_mut(id) else {
                return false;
            };
            if wf.status != WorkflowStatus::Created || state.queue.contains(id) {
                return false;
            }
            if let Err(e) = self.validate_for_start(wf) {
                warn!(workflow_id = %id, error = %e, "Workflow failed validation");
                wf.log_error(None, ErrorKind::Validation, e.to_string());
                return false;
            }
            self.admit(state, id)
        };

        match admitted {
            Ok(Admission::Run) => {
                self.emit(WorkflowEvent::Started {
                    workflow_id: id.clone(),
                });
                self.spawn_loop(id.clone());
                true
            }
            Ok(Admission::Queued) => {
                self.announce_queued(id);
                true
            }
            Err(e) => {
                warn!(workflow_id = %id, error = %e, "Workflow not admitted");
                false
            }
        }
    }

    /// Validate and run inline until the loop halts.
    pub async fn execute(self: &Arc<Self>, id: &WorkflowId) -> Result<WorkflowStatus> {
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let running = state.active.len();
            let queued = state.queue.len();
            let wf = state
                .workflows
                .get_mut(id)
                .ok_or_else(|| CascadeError::WorkflowNotFound(id.to_string()))?;
            if wf.status != WorkflowStatus::Created || state.queue.contains(id) {
                return Err(CascadeError::InvalidTransition {
                    from: wf.status.to_string(),
                    to: WorkflowStatus::Running.to_string(),
                });
            }
            if let Err(e) = self.validate_for_start(wf) {
                wf.log_error(None, ErrorKind::Validation, e.to_string());
                return Err(e);
            }
            if running >= self.config.max_concurrent_workflows {
                let e = CascadeError::AdmissionLimit { running, queued };
                wf.log_error(None, ErrorKind::Admission, e.to_string());
                return Err(e);
            }
            self.admit(state, id)?;
        }

        self.emit(WorkflowEvent::Started {
            workflow_id: id.clone(),
        });
        self.run_loop(id.clone()).await;
        self.lock_state()
            .workflows
            .get(id)
            .map(|wf| wf.status)
            .ok_or_else(|| CascadeError::WorkflowNotFound(id.to_string()))
    }

    /// Running → Paused. The in-flight role, if any, finishes first.
    pub fn pause(&self, id: &WorkflowId) -> bool {
        let snapshot = {
            let mut guard = self.lock_state();
            let Some(wf) = guard.workflows.get_mut(id) else {
                return false;
            };
            if wf.status != WorkflowStatus::Running {
                return false;
            }
            wf.status = WorkflowStatus::Paused;
            wf.clone()
        };

        info!(workflow_id = %id, progress = %snapshot.progress(), "Workflow paused");
        self.emit(WorkflowEvent::Paused {
            workflow_id: id.clone(),
            reason: "paused by request".to_string(),
        });
        self.fire_hook(Hook::WorkflowPaused, &snapshot, None);
        self.save_checkpoint(&snapshot);
        self.changed.notify_waiters();
        true
    }

    /// Paused → Running, continuing from the current role.
    pub fn resume(self: &Arc<Self>, id: &WorkflowId) -> bool {
        enum Resumption {
            InPlace,
            Spawn,
            Queued,
        }

        let (resumption, snapshot) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let running = state.active.len();
            let Some(wf) = state.workflows.get_mut(id) else {
                return false;
            };
            if wf.status != WorkflowStatus::Paused || state.queue.contains(id) {
                return false;
            }

            let resumption = if state.active.contains(id) {
                // Loop is still finishing its in-flight role and will pick this up
                Resumption::InPlace
            } else if running < self.config.max_concurrent_workflows {
                state.active.insert(id.clone());
                Resumption::Spawn
            } else {
                let now = Utc::now();
                if !state.queue.push(id.clone(), wf.task.priority, now) {
                    wf.log_error(None, ErrorKind::Admission, "admission queue is full");
                    return false;
                }
                wf.queued_at = Some(now);
                Resumption::Queued
            };

            if !matches!(resumption, Resumption::Queued) {
                wf.status = WorkflowStatus::Running;
                wf.pending_intervention = None;
                wf.started_at.get_or_insert_with(Utc::now);
            }
            (resumption, wf.clone())
        };

        match resumption {
            Resumption::Queued => self.announce_queued(id),
            Resumption::InPlace | Resumption::Spawn => {
                info!(workflow_id = %id, progress = %snapshot.progress(), "Workflow resumed");
                self.emit(WorkflowEvent::Resumed {
                    workflow_id: id.clone(),
                });
                self.save_checkpoint(&snapshot);
                if matches!(resumption, Resumption::Spawn) {
                    self.spawn_loop(id.clone());
                }
            }
        }
        self.changed.notify_waiters();
        true
    }

    /// Running, Paused or queued → Cancelled.
    pub fn cancel(&self, id: &WorkflowId) -> bool {
        let snapshot = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let queued = state.queue.contains(id);
            let Some(wf) = state.workflows.get_mut(id) else {
                return false;
            };
            let cancellable = matches!(wf.status, WorkflowStatus::Running | WorkflowStatus::Paused)
                || (wf.status == WorkflowStatus::Created && queued);
            if !cancellable {
                return false;
            }
            state.queue.remove(id);

            finish(wf, WorkflowStatus::Cancelled);
            for status in wf.role_status.values_mut() {
                if *status == RoleStatus::Pending {
                    *status = RoleStatus::Cancelled;
                }
            }
            push_history(&mut state.history, self.config.history_limit, wf);
            wf.clone()
        };

        info!(workflow_id = %id, progress = %snapshot.progress(), "Workflow cancelled");
        self.emit(WorkflowEvent::Cancelled {
            workflow_id: id.clone(),
        });
        self.save_checkpoint(&snapshot);
        self.changed.notify_waiters();
        true
    }

    /// Wait until the workflow is neither running nor queued.
    pub async fn wait(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock_state();
                let wf = state.workflows.get(id)?;
                if wf.status != WorkflowStatus::Running && !state.queue.contains(id) {
                    return Some(wf.status);
                }
            }
            notified.await;
        }
    }

    /// `wait` on several workflows; results in the order given.
    pub async fn wait_all(&self, ids: &[WorkflowId]) -> Vec<Option<WorkflowStatus>> {
        join_ordered(ids.iter().map(|id| self.wait(id))).await
    }

    pub fn get_status(&self, id: &WorkflowId) -> Option<StatusSummary> {
        self.lock_state().workflows.get(id).map(|wf| wf.summary())
    }

    /// All workflows, oldest first, optionally filtered by status.
    pub fn list_workflows(&self, filter: Option<WorkflowStatus>) -> Vec<StatusSummary> {
        let state = self.lock_state();
        let mut list: Vec<StatusSummary> = state
            .workflows
            .values()
            .filter(|wf| filter.map_or(true, |s| wf.status == s))
            .map(|wf| wf.summary())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn snapshot(&self, id: &WorkflowId) -> Option<WorkflowExecution> {
        self.lock_state().workflows.get(id).cloned()
    }

    /// Re-register a checkpointed workflow. One that was running when the
    /// snapshot was taken comes back paused.
    pub fn restore(&self, mut execution: WorkflowExecution) -> Result<WorkflowId> {
        if execution.status == WorkflowStatus::Running {
            execution.status = WorkflowStatus::Paused;
            for status in execution.role_status.values_mut() {
                if *status == RoleStatus::Running {
                    *status = RoleStatus::Pending;
                }
            }
        }
        execution.queued_at = None;

        let id = execution.id.clone();
        let mut state = self.lock_state();
        if state.workflows.contains_key(&id) {
            return Err(CascadeError::Validation(format!(
                "workflow {} is already registered",
                id
            )));
        }
        info!(
            workflow_id = %id,
            status = %execution.status,
            progress = %execution.progress(),
            "Workflow restored"
        );
        state.workflows.insert(id.clone(), execution);
        Ok(id)
    }

    pub fn stats(&self) -> ExecutionStats {
        let state = self.lock_state();
        let count = |status: WorkflowStatus| {
            state
                .history
                .iter()
                .filter(|r| r.status == status)
                .count()
        };
        let completed = count(WorkflowStatus::Completed);
        let total = state.history.len();

        let durations: Vec<u64> = state
            .history
            .iter()
            .filter(|r| r.status == WorkflowStatus::Completed)
            .map(|r| r.execution_ms)
            .collect();
        let average_execution_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        ExecutionStats {
            registered: state.workflows.len(),
            running: state
                .workflows
                .values()
                .filter(|wf| wf.status == WorkflowStatus::Running)
                .count(),
            paused: state
                .workflows
                .values()
                .filter(|wf| wf.status == WorkflowStatus::Paused)
                .count(),
            queued: state.queue.len(),
            total_executions: total,
            completed,
            failed: count(WorkflowStatus::Failed),
            cancelled: count(WorkflowStatus::Cancelled),
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            average_execution_ms,
        }
    }

    // -- Admission ----------------------------------------------------------

    fn validate_for_start(&self, wf: &WorkflowExecution) -> Result<()> {
        if wf.roles.is_empty() {
            return Err(CascadeError::Validation("role sequence is empty".to_string()));
        }
        let validation = self.analyzer.validate_sequence(&wf.roles);
        let errors: Vec<String> = validation
            .errors
            .iter()
            .filter(|e| {
                self.config.strict_dependencies || matches!(e, DependencyIssue::UnknownRole { .. })
            })
            .map(|e| e.to_string())
            .collect();
        for warning in &validation.warnings {
            debug!(workflow_id = %wf.id, warning = %warning, "Sequence warning");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CascadeError::Validation(errors.join("; ")))
        }
    }

    /// Take a slot or join the queue. Caller holds the state lock.
    fn admit(&self, state: &mut EngineState, id: &WorkflowId) -> Result<Admission> {
        let running = state.active.len();
        let queued = state.queue.len();
        let wf = state
            .workflows
            .get_mut(id)
            .ok_or_else(|| CascadeError::WorkflowNotFound(id.to_string()))?;

        if running < self.config.max_concurrent_workflows {
            wf.status = WorkflowStatus::Running;
            wf.started_at.get_or_insert_with(Utc::now);
            wf.queued_at = None;
            state.active.insert(id.clone());
            info!(workflow_id = %id, roles = wf.roles.len(), "Workflow started");
            return Ok(Admission::Run);
        }

        let now = Utc::now();
        if !state.queue.push(id.clone(), wf.task.priority, now) {
            let e = CascadeError::AdmissionLimit { running, queued };
            wf.log_error(None, ErrorKind::Admission, e.to_string());
            return Err(e);
        }
        wf.queued_at = Some(now);
        Ok(Admission::Queued)
    }

    fn announce_queued(&self, id: &WorkflowId) {
        let priority = {
            let state = self.lock_state();
            state.workflows.get(id).map(|wf| wf.task.priority)
        };
        if let Some(priority) = priority {
            info!(workflow_id = %id, priority, "Workflow queued");
            self.emit(WorkflowEvent::Queued {
                workflow_id: id.clone(),
                priority,
            });
        }
    }

    fn spawn_loop(self: &Arc<Self>, id: WorkflowId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_loop(id).await;
        });
    }

    async fn run_loop(self: &Arc<Self>, id: WorkflowId) {
        if let Some(wf) = self.snapshot(&id) {
            self.fire_hook(Hook::WorkflowStart, &wf, None);
        }
        loop {
            self.drive(&id).await;
            if !self.release(&id) {
                break;
            }
            debug!(workflow_id = %id, "Resumed while exiting, continuing loop");
        }
    }

    /// Give up the slot and admit queued workflows. Returns true when the
    /// workflow was resumed in the meantime and its loop must keep going.
    fn release(self: &Arc<Self>, id: &WorkflowId) -> bool {
        let mut admitted = Vec::new();
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state
                .workflows
                .get(id)
                .is_some_and(|wf| wf.status == WorkflowStatus::Running)
            {
                return true;
            }
            state.active.remove(id);

            while state.active.len() < self.config.max_concurrent_workflows {
                let Some(next) = state.queue.pop() else {
                    break;
                };
                let Some(wf) = state.workflows.get_mut(&next) else {
                    continue;
                };
                let resumed = match wf.status {
                    WorkflowStatus::Created => false,
                    WorkflowStatus::Paused => true,
                    _ => continue,
                };
                wf.status = WorkflowStatus::Running;
                wf.started_at.get_or_insert_with(Utc::now);
                wf.queued_at = None;
                wf.pending_intervention = None;
                state.active.insert(next.clone());
                admitted.push((next, resumed));
            }
        }

        for (next, resumed) in admitted {
            info!(workflow_id = %next, "Admitted from queue");
            let event = if resumed {
                WorkflowEvent::Resumed {
                    workflow_id: next.clone(),
                }
            } else {
                WorkflowEvent::Started {
                    workflow_id: next.clone(),
                }
            };
            self.emit(event);
            self.spawn_loop(next);
        }
        self.changed.notify_waiters();
        false
    }

    // -- Role loop ----------------------------------------------------------

    async fn drive(&self, id: &WorkflowId) {
        loop {
            let (role, index, context) = match self.next_step(id) {
                Step::Run {
                    role,
                    index,
                    context,
                } => (role, index, context),
                Step::Finished(snapshot) => {
                    self.on_finished(&snapshot);
                    return;
                }
                Step::Halt => return,
            };

            info!(workflow_id = %id, role = %role, index, "Role started");
            self.emit(WorkflowEvent::RoleStarted {
                workflow_id: id.clone(),
                role: role.clone(),
                index,
            });
            if let Some(wf) = self.snapshot(id) {
                self.fire_hook(Hook::RoleStart, &wf, Some(&role));
            }

            let started = Instant::now();
            let outcome = self.executor.execute(role.clone(), context).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) if result.succeeded() => {
                    self.complete_role(id, &role, index, result, elapsed_ms).await
                }
                Ok(result) => {
                    let message = result
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("role '{}' reported failure", role));
                    self.fail_role(id, &role, index, ErrorKind::RoleExecution, message, result.error_type)
                        .await
                }
                Err(e) => {
                    self.fail_role(id, &role, index, ErrorKind::RoleExecution, e.to_string(), None)
                        .await
                }
            }
        }
    }

    /// Decide what the loop does next. Stops between roles when the status
    /// was changed out-of-band.
    fn next_step(&self, id: &WorkflowId) -> Step {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(wf) = state.workflows.get_mut(id) else {
            return Step::Halt;
        };
        if wf.status != WorkflowStatus::Running {
            return Step::Halt;
        }

        if wf.is_finished() {
            finish(wf, WorkflowStatus::Completed);
            push_history(&mut state.history, self.config.history_limit, wf);
            return Step::Finished(wf.clone());
        }

        let index = wf.current_role_index;
        let role = wf.roles[index].clone();
        match self.build_context(wf, &role) {
            Ok(context) => {
                wf.contexts.insert(role.clone(), context.clone());
                wf.set_role_status(&role, RoleStatus::Running);
                Step::Run {
                    role,
                    index,
                    context,
                }
            }
            Err(e) => {
                error!(workflow_id = %id, role = %role, error = %e, "Failed to build role context");
                wf.log_error(Some(&role), ErrorKind::System, e.to_string());
                finish(wf, WorkflowStatus::Failed);
                push_history(&mut state.history, self.config.history_limit, wf);
                Step::Finished(wf.clone())
            }
        }
    }

    fn build_context(&self, wf: &mut WorkflowExecution, role: &str) -> Result<IsolatedRoleContext> {
        let mut ctx = self.contexts.create_isolated(&wf.id, role, wf.pending_handoff())?;
        if ctx.handoff_id.is_none() {
            ctx.write(Section::PrimaryIntent, wf.task.description.clone(), INTENT_WEIGHT)?;
        }
        for requirement in &wf.task.requirements {
            ctx.append(Section::UserMessages, &format!("- {}", requirement), PRIMARY_WEIGHT)?;
        }

        // A retried role sees why its last attempt failed
        if wf.retry_counts.get(role).copied().unwrap_or(0) > 0 {
            if let Some(last) = wf
                .error_log
                .iter()
                .rev()
                .find(|e| e.role.as_deref() == Some(role))
            {
                ctx.append(
                    Section::ErrorsAndFixes,
                    &format!("Previous attempt failed: {}", last.message),
                    RETRY_NOTE_WEIGHT,
                )?;
            }
        }

        if let Some(h) = wf.pending_handoff.and_then(|i| wf.handoffs.get_mut(i)) {
            if h.status == HandoffStatus::Pending {
                h.status = HandoffStatus::Accepted;
            }
        }
        Ok(ctx)
    }

    async fn complete_role(
        &self,
        id: &WorkflowId,
        role: &str,
        index: usize,
        mut result: RoleResult,
        elapsed_ms: u64,
    ) {
        if result.execution_time_ms == 0 {
            result.execution_time_ms = elapsed_ms;
        }

        let mut handoff_failure = None;
        let mut handoff_created = None;
        let snapshot = {
            let mut guard = self.lock_state();
            let Some(wf) = guard.workflows.get_mut(id) else {
                return;
            };
            if wf.status.is_terminal() {
                // Cancelled while the role ran; drop its output
                wf.set_role_status(role, RoleStatus::Cancelled);
                return;
            }
            wf.results.insert(role.to_string(), result.clone());

            match wf.roles.get(index + 1).cloned() {
                Some(next) => {
                    let outcome = self.handoffs.create_handoff(
                        &wf.id,
                        role,
                        &next,
                        &wf.task.description,
                        &result,
                    );
                    for warning in &outcome.validation.warnings {
                        debug!(workflow_id = %id, from = role, to = %next, warning = %warning, "Handoff warning");
                    }
                    if outcome.validation.passed {
                        handoff_created = Some((next, outcome.validation.score));
                        wf.handoffs.push(outcome.record);
                        wf.pending_handoff = Some(wf.handoffs.len() - 1);
                    } else {
                        handoff_failure = Some(format!(
                            "handoff to '{}' is missing required fields: {}",
                            next,
                            outcome.validation.missing_fields.join(", ")
                        ));
                        wf.handoffs.push(outcome.record);
                    }
                }
                None => wf.pending_handoff = None,
            }

            if handoff_failure.is_none() {
                if let Some(ctx) = wf.contexts.get_mut(role) {
                    self.contexts.compress(ctx);
                }
                wf.set_role_status(role, RoleStatus::Completed);
                wf.current_role_index = index + 1;
            }
            wf.clone()
        };

        if let Some(message) = handoff_failure {
            return self
                .fail_role(id, role, index, ErrorKind::HandoffValidation, message, None)
                .await;
        }

        info!(
            workflow_id = %id,
            role,
            elapsed_ms = result.execution_time_ms,
            progress = %snapshot.progress(),
            "Role completed"
        );
        self.emit(WorkflowEvent::RoleCompleted {
            workflow_id: id.clone(),
            role: role.to_string(),
            elapsed_ms: result.execution_time_ms,
        });
        if let Some((to, score)) = handoff_created {
            self.emit(WorkflowEvent::HandoffCreated {
                workflow_id: id.clone(),
                from: role.to_string(),
                to,
                score,
            });
        }
        self.fire_hook(Hook::RoleComplete, &snapshot, Some(role));
        self.save_checkpoint(&snapshot);
        self.changed.notify_waiters();
    }

    async fn fail_role(
        &self,
        id: &WorkflowId,
        role: &str,
        index: usize,
        kind: ErrorKind,
        message: String,
        error_type: Option<String>,
    ) {
        warn!(workflow_id = %id, role, kind = kind.as_str(), error = %message, "Role failed");

        let (prepared, snapshot) = {
            let mut guard = self.lock_state();
            let Some(wf) = guard.workflows.get_mut(id) else {
                return;
            };
            wf.log_error(Some(role), kind, message.clone());

            let prepared = match wf.status {
                WorkflowStatus::Running => {
                    wf.set_role_status(role, RoleStatus::Failed);
                    let remaining = wf.roles.get(index + 1..).unwrap_or(&[]);
                    let original = wf.original_of(role);
                    let mut impact = if original == role {
                        self.analyzer.assess_failure_impact(role, remaining)
                    } else {
                        self.analyzer
                            .assess_substitute_failure(role, original, remaining)
                    };
                    let tried = wf.tried_for(original);
                    if tried.len() > self.config.max_retries as usize {
                        impact.replacements.clear();
                    } else {
                        impact.replacements.retain(|r| {
                            !wf.roles.contains(r) && !tried.contains(&r.as_str())
                        });
                    }

                    let mut report = FailureReport::new(wf.id.clone(), role, kind, message.clone());
                    report.error_type = error_type;
                    report.retry_count = wf.retry_counts.get(role).copied().unwrap_or(0);
                    Some((report, impact))
                }
                // Paused out-of-band while the role ran: re-run it on resume
                WorkflowStatus::Paused => {
                    wf.set_role_status(role, RoleStatus::Pending);
                    None
                }
                _ => {
                    wf.set_role_status(role, RoleStatus::Cancelled);
                    None
                }
            };
            (prepared, wf.clone())
        };

        self.emit(WorkflowEvent::RoleFailed {
            workflow_id: id.clone(),
            role: role.to_string(),
            error: message,
        });
        self.fire_hook(Hook::RoleFailed, &snapshot, Some(role));

        let Some((report, impact)) = prepared else {
            self.save_checkpoint(&snapshot);
            self.changed.notify_waiters();
            return;
        };

        debug!(
            workflow_id = %id,
            role,
            level = ?impact.level,
            blocked = ?impact.blocked,
            degraded = ?impact.degraded,
            "Assessed failure impact"
        );
        let decision = self.recovery.recover(&report, &impact).await;
        self.emit(WorkflowEvent::RecoveryDecided {
            workflow_id: id.clone(),
            role: role.to_string(),
            action: decision.action.to_string(),
            automatic: decision.automatic,
        });
        self.apply_recovery(id, role, index, decision);
    }

    fn apply_recovery(&self, id: &WorkflowId, role: &str, index: usize, decision: RecoveryDecision) {
        let mut paused_reason = None;
        let snapshot = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(wf) = state.workflows.get_mut(id) else {
                return;
            };
            wf.recovery_actions.push(AppliedRecovery {
                role: role.to_string(),
                action: decision.action.to_string(),
                automatic: decision.automatic,
                rationale: decision.rationale.clone(),
                timestamp: Utc::now(),
            });

            let unusable = matches!(
                &decision.action,
                RecoveryAction::Replace { role: r }
                    if wf.roles.contains(r)
                        || wf.replaced.contains_key(r)
                        || !self.analyzer.catalog().contains(r)
            );
            let action = if unusable {
                warn!(workflow_id = %id, role, action = %decision.action, "Replacement unusable");
                RecoveryAction::ManualIntervention
            } else {
                decision.action.clone()
            };

            match action {
                RecoveryAction::Retry => {
                    let attempt = wf.retry_counts.get(role).copied().unwrap_or(0) + 1;
                    if attempt > self.config.max_retries {
                        let message = format!(
                            "role '{}' still failing after {} retries",
                            role, self.config.max_retries
                        );
                        wf.log_error(Some(role), ErrorKind::RetryExhausted, message);
                        finish(wf, WorkflowStatus::Failed);
                        push_history(&mut state.history, self.config.history_limit, wf);
                    } else {
                        wf.retry_counts.insert(role.to_string(), attempt);
                        wf.set_role_status(role, RoleStatus::Pending);
                        info!(workflow_id = %id, role, attempt, "Retrying role");
                    }
                }
                RecoveryAction::Skip => {
                    wf.set_role_status(role, RoleStatus::Skipped);
                    wf.current_role_index = index + 1;
                    wf.pending_handoff = None;
                    info!(workflow_id = %id, role, "Skipped role");
                }
                RecoveryAction::Replace { role: replacement } => {
                    wf.substitute(index, &replacement);
                    info!(
                        workflow_id = %id,
                        role,
                        replacement = %replacement,
                        stands_in_for = wf.original_of(&replacement),
                        "Replaced role"
                    );
                }
                RecoveryAction::ManualIntervention => {
                    wf.status = WorkflowStatus::Paused;
                    wf.set_role_status(role, RoleStatus::Pending);
                    wf.pending_intervention = Some(PendingIntervention {
                        role: role.to_string(),
                        reason: decision.rationale.clone(),
                        requested_at: Utc::now(),
                    });
                    paused_reason = Some(decision.rationale.clone());
                }
            }
            wf.clone()
        };

        if let Some(reason) = paused_reason {
            warn!(workflow_id = %id, role, reason = %reason, "Workflow paused for manual intervention");
            self.emit(WorkflowEvent::Paused {
                workflow_id: id.clone(),
                reason,
            });
            self.fire_hook(Hook::WorkflowPaused, &snapshot, Some(role));
            self.save_checkpoint(&snapshot);
            self.changed.notify_waiters();
        } else if snapshot.status == WorkflowStatus::Failed {
            self.on_finished(&snapshot);
        } else {
            self.save_checkpoint(&snapshot);
        }
    }

    fn on_finished(&self, wf: &WorkflowExecution) {
        match wf.status {
            WorkflowStatus::Completed => {
                info!(workflow_id = %wf.id, total_ms = wf.total_execution_ms, "Workflow completed");
                self.emit(WorkflowEvent::Completed {
                    workflow_id: wf.id.clone(),
                    total_ms: wf.total_execution_ms,
                });
            }
            _ => {
                let error = wf
                    .error_log
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "workflow failed".to_string());
                error!(workflow_id = %wf.id, error = %error, "Workflow failed");
                self.emit(WorkflowEvent::Failed {
                    workflow_id: wf.id.clone(),
                    error,
                });
            }
        }
        self.fire_hook(Hook::WorkflowComplete, wf, None);
        self.save_checkpoint(wf);
        self.changed.notify_waiters();
    }

    // -- Side channels ------------------------------------------------------

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn save_checkpoint(&self, wf: &WorkflowExecution) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(wf) {
                warn!(workflow_id = %wf.id, error = %e, "Failed to save checkpoint");
            }
        }
    }

    /// Fire-and-forget hook commands with `CASCADE_*` env vars.
    fn fire_hook(&self, hook: Hook, wf: &WorkflowExecution, role: Option<&str>) {
        let Some(hooks) = &self.hooks else {
            return;
        };
        let (event, commands) = match hook {
            Hook::WorkflowStart => ("workflow_start", &hooks.on_workflow_start),
            Hook::RoleStart => ("role_start", &hooks.on_role_start),
            Hook::RoleComplete => ("role_complete", &hooks.on_role_complete),
            Hook::RoleFailed => ("role_failed", &hooks.on_role_failed),
            Hook::WorkflowPaused => ("workflow_paused", &hooks.on_workflow_paused),
            Hook::WorkflowComplete => ("workflow_complete", &hooks.on_workflow_complete),
        };
        if commands.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(workflow_id = %wf.id, hook = event, "No async runtime, hooks skipped");
            return;
        };

        let commands = commands.clone();
        let ctx = HookContext {
            event: event.to_string(),
            workflow_id: wf.id.to_string(),
            status: wf.status.to_string(),
            progress: wf.progress(),
            role: role.map(str::to_string),
        };
        handle.spawn(async move {
            run_hooks(&commands, &ctx).await;
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Move to a terminal status and stamp the timings.
fn finish(wf: &mut WorkflowExecution, status: WorkflowStatus) {
    let now = Utc::now();
    wf.status = status;
    wf.completed_at = Some(now);
    wf.total_execution_ms = wf
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
}

/// Bounded history: past the limit, keep the newest half.
fn push_history(history: &mut Vec<ExecutionRecord>, limit: usize, wf: &WorkflowExecution) {
    history.push(ExecutionRecord {
        workflow_id: wf.id.clone(),
        status: wf.status,
        execution_ms: wf.total_execution_ms,
        finished_at: wf.completed_at.unwrap_or_else(Utc::now),
    });
    let limit = limit.max(2);
    if history.len() > limit {
        let excess = history.len() - limit / 2;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cascade_test_utils::{
        sample_catalog, software_catalog, temp_db_path, ScriptedExecutor, ScriptedOutcome,
    };

    use super::*;
    use cascade_core::catalog::RoleDefinition;

    fn roles(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn engine_with(executor: Arc<ScriptedExecutor>) -> Arc<WorkflowEngine> {
        Arc::new(WorkflowEngine::new(Arc::new(sample_catalog()), executor))
    }

    #[tokio::test]
    async fn test_execute_runs_roles_in_order() {
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("Summarize a report"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        let status = engine.execute(&wf.id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(executor.calls(), roles(&["reader", "analyst", "writer"]));

        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.progress(), "3/3");
        assert_eq!(snap.handoffs.len(), 2);
        assert!(snap.handoffs.iter().all(|h| h.status == HandoffStatus::Accepted));
        assert!(snap.contexts.values().all(|c| c.compressed));
        assert!(snap.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_second_role_context_seeded_from_handoff() {
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("Summarize a report"), roles(&["reader", "analyst"]))
            .unwrap();
        engine.execute(&wf.id).await.unwrap();

        let contexts = executor.contexts();
        assert!(contexts[0].handoff_id.is_none());
        assert_eq!(
            contexts[0].section(Section::PrimaryIntent).unwrap().content,
            "Summarize a report"
        );
        assert!(contexts[1].handoff_id.is_some());
        assert!(contexts[1]
            .section(Section::CurrentWork)
            .unwrap()
            .content
            .contains("reader"));
    }

    #[tokio::test]
    async fn test_validation_error_keeps_created() {
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(software_catalog()), executor.clone()).with_config(
                EngineConfig {
                    auto_adjust_sequence: false,
                    ..EngineConfig::default()
                },
            ),
        );
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["coder", "planner", "tester"]))
            .unwrap();

        let err = engine.execute(&wf.id).await.unwrap_err();
        assert!(matches!(err, CascadeError::Validation(_)));
        assert!(err.to_string().contains("coder"));
        assert!(err.to_string().contains("planner"));

        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.status, WorkflowStatus::Created);
        assert_eq!(snap.error_log[0].kind, ErrorKind::Validation);
        assert!(!engine.start(&wf.id));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_adjust_on_create() {
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(software_catalog()),
            Arc::new(ScriptedExecutor::new()),
        ));
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["coder", "planner"]))
            .unwrap();
        assert!(wf.sequence_adjusted);
        assert_eq!(wf.roles, roles(&["planner", "coder"]));
    }

    #[tokio::test]
    async fn test_unknown_role_rejected() {
        let engine = engine_with(Arc::new(ScriptedExecutor::new()));
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "ghost"]))
            .unwrap();
        let err = engine.execute(&wf.id).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(engine.create_workflow(TaskSpec::new("t"), vec![]).is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let executor = Arc::new(
            ScriptedExecutor::new().script("analyst", ScriptedOutcome::error("request timeout")),
        );
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Completed);
        assert_eq!(executor.call_count("analyst"), 2);

        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.retry_counts.get("analyst"), Some(&1));
        assert_eq!(snap.recovery_actions[0].action, "retry");
        assert_eq!(snap.error_log.len(), 1);
        // Retried context carries the previous error
        let retried = &executor.contexts()[2];
        assert!(retried
            .section(Section::ErrorsAndFixes)
            .unwrap()
            .content
            .contains("request timeout"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_fails() {
        let executor = Arc::new(ScriptedExecutor::new());
        for _ in 0..5 {
            executor.push("analyst", ScriptedOutcome::error("connection reset by peer"));
        }
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Failed);
        // initial attempt + 3 retries
        assert_eq!(executor.call_count("analyst"), 4);
        assert_eq!(executor.call_count("writer"), 0);

        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.error_log.last().unwrap().kind, ErrorKind::RetryExhausted);
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_system_error_pauses_for_manual_intervention() {
        let executor = Arc::new(
            ScriptedExecutor::new().script("analyst", ScriptedOutcome::failure("thread panicked")),
        );
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Paused);
        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.current_role_index, 1);
        assert_eq!(snap.pending_intervention.as_ref().unwrap().role, "analyst");
        assert_eq!(snap.role_status["analyst"], RoleStatus::Pending);

        // Resume re-runs the failed role from scratch
        assert!(engine.resume(&wf.id));
        assert_eq!(engine.wait(&wf.id).await, Some(WorkflowStatus::Completed));
        assert_eq!(executor.call_count("analyst"), 2);
        assert!(engine.snapshot(&wf.id).unwrap().pending_intervention.is_none());
    }

    #[tokio::test]
    async fn test_skip_when_nothing_depends() {
        let executor = Arc::new(
            ScriptedExecutor::new().script("illustrator", ScriptedOutcome::failure("incomplete output")),
        );
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(
                TaskSpec::new("t"),
                roles(&["reader", "analyst", "illustrator", "writer"]),
            )
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Completed);
        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.role_status["illustrator"], RoleStatus::Skipped);
        assert_eq!(snap.role_status["writer"], RoleStatus::Completed);
        assert_eq!(snap.recovery_actions[0].action, "skip");
        // The role after a skipped one starts without a handoff
        assert!(executor.contexts()[3].handoff_id.is_none());
    }

    #[tokio::test]
    async fn test_replace_with_compatible_role() {
        let executor = Arc::new(
            ScriptedExecutor::new().script("analyst", ScriptedOutcome::failure("wrong approach")),
        );
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Completed);
        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.roles, roles(&["reader", "backup_analyst", "writer"]));
        assert_eq!(
            executor.calls(),
            roles(&["reader", "analyst", "backup_analyst", "writer"])
        );
    }

    #[tokio::test]
    async fn test_failed_substitute_is_not_skipped_past_dependents() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .script("analyst", ScriptedOutcome::failure("wrong approach"))
                .script("backup_analyst", ScriptedOutcome::failure("wrong approach")),
        );
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        // writer needs analyst output, so backup_analyst cannot be skipped
        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Paused);
        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.original_of("backup_analyst"), "analyst");
        let actions: Vec<_> = snap.recovery_actions.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec!["replace with backup_analyst", "manual_intervention"]);
        assert_eq!(snap.role_status["writer"], RoleStatus::Pending);
        assert_eq!(snap.role_status["backup_analyst"], RoleStatus::Pending);
        assert_eq!(
            snap.pending_intervention.unwrap().role,
            "backup_analyst"
        );
        assert_eq!(executor.call_count("writer"), 0);
    }

    fn peers_catalog() -> RoleCatalog {
        let peer = |id: &str| {
            RoleDefinition::new(id)
                .with_domains(&["research"])
                .with_sub_domains(&["survey"])
                .with_output_types(&["notes"])
        };
        RoleCatalog::new(vec![
            peer("a"),
            peer("b"),
            peer("d"),
            RoleDefinition::new("c").with_strong(&["a"]),
        ])
    }

    fn failing_peers() -> Arc<ScriptedExecutor> {
        let executor = ScriptedExecutor::new();
        for role in ["a", "b", "d"] {
            for _ in 0..10 {
                executor.push(role, ScriptedOutcome::failure("wrong approach"));
            }
        }
        Arc::new(executor)
    }

    #[tokio::test]
    async fn test_replacement_never_revisits_tried_roles() {
        let executor = failing_peers();
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(peers_catalog()),
            executor.clone(),
        ));
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["a", "c"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Paused);
        assert_eq!(executor.calls(), roles(&["a", "b", "d"]));
        let snap = engine.snapshot(&wf.id).unwrap();
        assert_eq!(snap.recovery_actions.len(), 3);
        assert_eq!(snap.recovery_actions[2].action, "manual_intervention");
        assert_eq!(snap.tried_for("a"), vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn test_replacements_count_against_retry_budget() {
        let executor = failing_peers();
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(peers_catalog()), executor.clone()).with_config(
                EngineConfig {
                    max_retries: 1,
                    ..EngineConfig::default()
                },
            ),
        );
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["a", "c"]))
            .unwrap();

        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Paused);
        // d is still compatible but the slot has used its budget
        assert_eq!(executor.calls(), roles(&["a", "b"]));
        assert_eq!(executor.call_count("c"), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_does_not_rerun() {
        let executor = Arc::new(ScriptedExecutor::new());
        let gate = executor.hold("reader");
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();

        assert!(engine.start(&wf.id));
        gate.entered().await;
        assert!(engine.pause(&wf.id));
        assert!(!engine.pause(&wf.id));
        gate.release();

        assert_eq!(engine.wait(&wf.id).await, Some(WorkflowStatus::Paused));
        // Let the loop finish the in-flight role and exit
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = engine.get_status(&wf.id).unwrap();
        assert_eq!(status.progress, "1/3");
        assert_eq!(status.current_role.as_deref(), Some("analyst"));

        assert!(engine.resume(&wf.id));
        assert!(!engine.resume(&wf.id));
        assert_eq!(engine.wait(&wf.id).await, Some(WorkflowStatus::Completed));
        assert_eq!(executor.calls(), roles(&["reader", "analyst", "writer"]));
    }

    #[tokio::test]
    async fn test_cancel() {
        let executor = Arc::new(ScriptedExecutor::new());
        let gate = executor.hold("reader");
        let engine = engine_with(executor.clone());
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst"]))
            .unwrap();

        assert!(!engine.cancel(&wf.id)); // Created and not queued
        assert!(engine.start(&wf.id));
        gate.entered().await;
        assert!(engine.cancel(&wf.id));
        assert!(!engine.cancel(&wf.id));
        gate.release();

        assert_eq!(engine.wait(&wf.id).await, Some(WorkflowStatus::Cancelled));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls(), roles(&["reader"]));
        assert_eq!(engine.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_admission_queue_by_priority() {
        let executor = Arc::new(ScriptedExecutor::new());
        let gate = executor.hold("reader");
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(sample_catalog()), executor.clone()).with_config(
                EngineConfig {
                    max_concurrent_workflows: 1,
                    max_queue_size: 2,
                    ..EngineConfig::default()
                },
            ),
        );

        let first = engine
            .create_workflow(TaskSpec::new("first"), roles(&["reader"]))
            .unwrap();
        let low = engine
            .create_workflow(TaskSpec::new("low").with_priority(2), roles(&["archivist"]))
            .unwrap();
        let high = engine
            .create_workflow(TaskSpec::new("high").with_priority(9), roles(&["illustrator"]))
            .unwrap();
        let overflow = engine
            .create_workflow(TaskSpec::new("overflow"), roles(&["illustrator"]))
            .unwrap();

        assert!(engine.start(&first.id));
        gate.entered().await;
        assert!(engine.start(&low.id));
        assert!(engine.start(&high.id));
        assert!(!engine.start(&overflow.id));
        assert_eq!(engine.stats().queued, 2);

        let rejected = engine.snapshot(&overflow.id).unwrap();
        assert_eq!(rejected.status, WorkflowStatus::Created);
        assert_eq!(rejected.error_log[0].kind, ErrorKind::Admission);

        gate.release();
        let statuses = engine.wait_all(&[first.id, low.id, high.id]).await;
        assert!(statuses
            .iter()
            .all(|s| *s == Some(WorkflowStatus::Completed)));
        assert_eq!(executor.calls(), roles(&["reader", "illustrator", "archivist"]));
    }

    #[tokio::test]
    async fn test_cancel_queued_workflow() {
        let executor = Arc::new(ScriptedExecutor::new());
        let gate = executor.hold("reader");
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(sample_catalog()), executor.clone()).with_config(
                EngineConfig {
                    max_concurrent_workflows: 1,
                    ..EngineConfig::default()
                },
            ),
        );
        let first = engine.create_workflow(TaskSpec::new("a"), roles(&["reader"])).unwrap();
        let second = engine.create_workflow(TaskSpec::new("b"), roles(&["illustrator"])).unwrap();

        assert!(engine.start(&first.id));
        gate.entered().await;
        assert!(engine.start(&second.id));
        assert!(engine.cancel(&second.id));
        gate.release();

        assert_eq!(engine.wait(&first.id).await, Some(WorkflowStatus::Completed));
        assert_eq!(engine.wait(&second.id).await, Some(WorkflowStatus::Cancelled));
        assert_eq!(executor.call_count("illustrator"), 0);
    }

    #[tokio::test]
    async fn test_handoff_validation_failure_goes_to_recovery() {
        // coder -> tester requires code_files etc; the default result lacks them
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(software_catalog()),
            executor.clone(),
        ));
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["planner", "coder", "tester"]))
            .unwrap();

        let status = engine.execute(&wf.id).await.unwrap();
        let snap = engine.snapshot(&wf.id).unwrap();
        assert!(snap
            .error_log
            .iter()
            .any(|e| e.kind == ErrorKind::HandoffValidation));
        assert!(snap
            .handoffs
            .iter()
            .any(|h| h.status == HandoffStatus::Rejected));
        // planner -> coder also uses a specific template, so the first role already fails
        assert_eq!(snap.error_log[0].role.as_deref(), Some("planner"));

        // coder needs planner and nothing can stand in for it
        assert_eq!(status, WorkflowStatus::Paused);
        assert_eq!(snap.current_role_index, 0);
        assert_eq!(snap.recovery_actions.len(), 1);
        assert_eq!(snap.recovery_actions[0].action, "manual_intervention");
        assert!(!snap.recovery_actions[0].automatic);
        let intervention = snap.pending_intervention.unwrap();
        assert_eq!(intervention.role, "planner");
        assert_eq!(snap.role_status["coder"], RoleStatus::Pending);
        assert_eq!(executor.calls(), roles(&["planner"]));
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(sample_catalog()), Arc::new(ScriptedExecutor::new()))
                .with_event_bus(bus.clone()),
        );
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst"]))
            .unwrap();
        engine.execute(&wf.id).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::Created { .. } => "created",
                WorkflowEvent::Started { .. } => "started",
                WorkflowEvent::RoleStarted { .. } => "role_started",
                WorkflowEvent::RoleCompleted { .. } => "role_completed",
                WorkflowEvent::HandoffCreated { .. } => "handoff",
                WorkflowEvent::Completed { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "created",
                "started",
                "role_started",
                "role_completed",
                "handoff",
                "role_started",
                "role_completed",
                "completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let store = Arc::new(CheckpointStore::open(&temp_db_path()).unwrap());
        let executor = Arc::new(
            ScriptedExecutor::new().script("analyst", ScriptedOutcome::failure("segfault")),
        );
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(sample_catalog()), executor)
                .with_checkpoints(store.clone()),
        );
        let wf = engine
            .create_workflow(TaskSpec::new("t"), roles(&["reader", "analyst", "writer"]))
            .unwrap();
        assert_eq!(engine.execute(&wf.id).await.unwrap(), WorkflowStatus::Paused);

        let saved = store.load(&wf.id.0).unwrap().unwrap();
        assert_eq!(saved.status, WorkflowStatus::Paused);
        assert_eq!(saved.current_role_index, 1);

        // A fresh engine picks up where the old one stopped
        let executor = Arc::new(ScriptedExecutor::new());
        let fresh = engine_with(executor.clone());
        let id = fresh.restore(saved.clone()).unwrap();
        assert!(fresh.restore(saved).is_err());
        assert!(fresh.resume(&id));
        assert_eq!(fresh.wait(&id).await, Some(WorkflowStatus::Completed));
        assert_eq!(executor.calls(), roles(&["analyst", "writer"]));
    }

    #[tokio::test]
    async fn test_restore_running_comes_back_paused() {
        let engine = engine_with(Arc::new(ScriptedExecutor::new()));
        let mut wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["reader"]));
        wf.status = WorkflowStatus::Running;
        wf.role_status.insert("reader".into(), RoleStatus::Running);
        let id = engine.restore(wf).unwrap();

        let snap = engine.snapshot(&id).unwrap();
        assert_eq!(snap.status, WorkflowStatus::Paused);
        assert_eq!(snap.role_status["reader"], RoleStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let engine = engine_with(Arc::new(ScriptedExecutor::new()));
        let a = engine.create_workflow(TaskSpec::new("a"), roles(&["reader"])).unwrap();
        engine.create_workflow(TaskSpec::new("b"), roles(&["reader"])).unwrap();
        engine.execute(&a.id).await.unwrap();

        assert_eq!(engine.list_workflows(None).len(), 2);
        let done = engine.list_workflows(Some(WorkflowStatus::Completed));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a.id);

        let stats = engine.stats();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = Vec::new();
        let wf = WorkflowExecution::new(TaskSpec::new("t"), roles(&["reader"]));
        for _ in 0..1001 {
            push_history(&mut history, 1000, &wf);
        }
        assert_eq!(history.len(), 500);
    }
}
