//! Error recovery: classify a role failure, generate recovery strategies,
//! and decide whether the engine may act on one automatically.
//!
//! Classification runs a chain of [`ErrorClassifier`]s. The first confident
//! answer wins; when nobody is confident the [`DefaultClassifier`] answers.
//! A classifier that errors out produces a system-level classification,
//! which always ends in manual intervention.

mod classifier;
mod strategy;

pub use classifier::{
    DefaultClassifier, ErrorClassifier, LlmClassifier, PatternClassifier, PatternRule,
};
pub use strategy::{decide, generate_strategies, strategy_score};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cascade_core::classification::{
    ErrorCategory, RecoveryApplicability, RecoveryFeasibility, Severity, WorkflowImpact,
};
use cascade_core::config::RecoveryConfig;
use cascade_core::error::Result;
use cascade_core::traits::LlmClient;
use cascade_core::types::{ErrorKind, WorkflowId};

use crate::dependency::FailureImpact;

/// A role failure handed to the recovery controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub workflow_id: WorkflowId,
    pub role: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Executor-supplied error type, if any.
    pub error_type: Option<String>,
    pub retry_count: u32,
}

impl FailureReport {
    pub fn new(
        workflow_id: WorkflowId,
        role: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            role: role.into(),
            kind,
            message: message.into(),
            error_type: None,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: Severity,
    pub category: ErrorCategory,
    pub feasibility: RecoveryFeasibility,
    pub impact: WorkflowImpact,
    pub applicability: RecoveryApplicability,
    pub confidence: f64,
    /// Name of the classifier that produced this.
    pub classifier: String,
    pub reasoning: String,
}

impl ErrorClassification {
    /// Classification used when a classifier itself fails.
    pub fn system_level(classifier: &str, reasoning: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            category: ErrorCategory::SystemBug,
            feasibility: RecoveryFeasibility::NonRecoverable,
            impact: WorkflowImpact::BlocksAll,
            applicability: RecoveryApplicability::RequiresSystemFix,
            confidence: 1.0,
            classifier: classifier.to_string(),
            reasoning: reasoning.into(),
        }
    }

    pub fn is_system_level(&self) -> bool {
        self.category == ErrorCategory::SystemBug
            || self.applicability == RecoveryApplicability::RequiresSystemFix
    }

    pub fn manual_only(&self) -> bool {
        self.applicability == RecoveryApplicability::RequiresManualIntervention
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Medium => 0.5,
            Self::High => 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    /// Run `role` in place of the failed one.
    Replace { role: String },
    ManualIntervention,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Replace { .. } => "replace",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace { role } => write!(f, "replace with {}", role),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    pub feasibility: f64,
    pub risk: RiskLevel,
    pub success_probability: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    /// False when a human has to step in.
    pub automatic: bool,
    pub strategy: Option<RecoveryStrategy>,
    pub classification: ErrorClassification,
    pub rationale: String,
}

/// One entry in the controller's recovery history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub workflow_id: WorkflowId,
    pub role: String,
    pub message: String,
    pub decision: RecoveryDecision,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub automatic: usize,
    pub manual: usize,
    pub by_action: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub cached_strategy_sets: usize,
}

/// Classifies failures and picks a recovery action.
pub struct ErrorRecoveryController {
    classifiers: Vec<Arc<dyn ErrorClassifier>>,
    fallback: DefaultClassifier,
    min_confidence: f64,
    max_strategies: usize,
    cache: Mutex<HashMap<u64, Vec<RecoveryStrategy>>>,
    history: Mutex<Vec<RecoveryRecord>>,
}

impl ErrorRecoveryController {
    /// Controller with only the built-in pattern rules.
    pub fn new() -> Self {
        Self::with_classifiers(vec![Arc::new(PatternClassifier::builtin())])
    }

    pub fn with_classifiers(classifiers: Vec<Arc<dyn ErrorClassifier>>) -> Self {
        let defaults = RecoveryConfig::default();
        Self {
            classifiers,
            fallback: DefaultClassifier,
            min_confidence: defaults.min_confidence,
            max_strategies: defaults.max_strategies,
            cache: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Build the chain from config. The LLM classifier joins only when
    /// enabled and a client is supplied.
    pub fn from_config(config: &RecoveryConfig, llm: Option<Arc<dyn LlmClient>>) -> Result<Self> {
        let mut classifiers: Vec<Arc<dyn ErrorClassifier>> =
            vec![Arc::new(PatternClassifier::from_config(&config.rules)?)];
        match (config.llm_enabled, llm) {
            (true, Some(client)) => classifiers.push(Arc::new(LlmClassifier::new(client))),
            (true, None) => warn!("LLM classification enabled but no client configured, skipping"),
            _ => {}
        }
        let mut controller = Self::with_classifiers(classifiers);
        controller.min_confidence = config.min_confidence;
        controller.max_strategies = config.max_strategies.max(1);
        Ok(controller)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn classifier_names(&self) -> Vec<String> {
        self.classifiers
            .iter()
            .map(|c| c.name().to_string())
            .chain(std::iter::once(self.fallback.name().to_string()))
            .collect()
    }

    /// Run the classifier chain.
    pub async fn classify(&self, failure: &FailureReport) -> ErrorClassification {
        for classifier in &self.classifiers {
            match classifier.classify(failure).await {
                Ok(Some(c)) if c.confidence >= self.min_confidence => {
                    debug!(
                        classifier = classifier.name(),
                        severity = %c.severity,
                        category = %c.category,
                        confidence = c.confidence,
                        "Failure classified"
                    );
                    return c;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        classifier = classifier.name(),
                        role = %failure.role,
                        error = %e,
                        "Classifier failed, treating as system error"
                    );
                    return ErrorClassification::system_level(
                        classifier.name(),
                        format!("classifier error: {}", e),
                    );
                }
            }
        }
        self.fallback.fallback(failure)
    }

    /// Strategies for a classification and impact. Memoized.
    pub fn generate_strategies(
        &self,
        classification: &ErrorClassification,
        impact: &FailureImpact,
    ) -> Vec<RecoveryStrategy> {
        let key = strategy::cache_key(classification, impact);
        if let Some(hit) = lock(&self.cache).get(&key) {
            return hit.clone();
        }
        let strategies = generate_strategies(classification, impact, self.max_strategies);
        lock(&self.cache).insert(key, strategies.clone());
        strategies
    }

    /// Classify, generate strategies, decide, and record the outcome.
    pub async fn recover(&self, failure: &FailureReport, impact: &FailureImpact) -> RecoveryDecision {
        let classification = self.classify(failure).await;
        let strategies = self.generate_strategies(&classification, impact);
        let decision = decide(&classification, &strategies);

        info!(
            workflow_id = %failure.workflow_id,
            role = %failure.role,
            action = %decision.action,
            automatic = decision.automatic,
            severity = %decision.classification.severity,
            "Recovery decided"
        );

        lock(&self.history).push(RecoveryRecord {
            workflow_id: failure.workflow_id.clone(),
            role: failure.role.clone(),
            message: failure.message.clone(),
            decision: decision.clone(),
            timestamp: Utc::now(),
        });
        decision
    }

    pub fn history(&self) -> Vec<RecoveryRecord> {
        lock(&self.history).clone()
    }

    pub fn stats(&self) -> RecoveryStats {
        let history = lock(&self.history);
        let mut stats = RecoveryStats {
            total: history.len(),
            cached_strategy_sets: lock(&self.cache).len(),
            ..RecoveryStats::default()
        };
        for record in history.iter() {
            if record.decision.automatic {
                stats.automatic += 1;
            } else {
                stats.manual += 1;
            }
            *stats
                .by_action
                .entry(record.decision.action.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_severity
                .entry(record.decision.classification.severity.to_string())
                .or_default() += 1;
        }
        stats
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }
}

impl Default for ErrorRecoveryController {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
