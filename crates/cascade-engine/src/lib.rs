pub mod admission;
pub mod checkpoint;
pub mod context;
pub mod dependency;
pub mod engine;
pub mod handoff;
pub mod parallel;
pub mod recovery;
pub mod run_log;
pub mod workflow;

pub use admission::AdmissionQueue;
pub use checkpoint::{CheckpointInfo, CheckpointStore};
pub use context::{CompressionReport, ContextEngine, ContextStats};
pub use dependency::{DependencyAnalyzer, DependencyIssue, FailureImpact, ImpactLevel, SequenceValidation};
pub use engine::{ExecutionStats, WorkflowEngine};
pub use handoff::{HandoffOrchestrator, HandoffTemplate, HandoffValidation};
pub use recovery::{
    ErrorClassification, ErrorClassifier, ErrorRecoveryController, FailureReport, RecoveryAction,
    RecoveryDecision,
};
pub use run_log::RunLogger;
pub use workflow::{StatusSummary, WorkflowExecution};
