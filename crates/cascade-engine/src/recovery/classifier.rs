use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use cascade_core::classification::{
    ErrorCategory, RecoveryApplicability, RecoveryFeasibility, Severity, WorkflowImpact,
};
use cascade_core::config::PatternRuleConfig;
use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::LlmClient;

use super::{ErrorClassification, FailureReport};

/// One link in the classification chain.
///
/// `Ok(Some)` is an answer, `Ok(None)` means "no opinion, ask the next one".
/// `Err` stops the chain with a system-level classification.
pub trait ErrorClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify<'a>(
        &'a self,
        failure: &'a FailureReport,
    ) -> BoxFuture<'a, Result<Option<ErrorClassification>>>;
}

/// A compiled regex rule and the verdict it yields.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub regex: Regex,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub feasibility: RecoveryFeasibility,
    pub impact: WorkflowImpact,
    pub applicability: RecoveryApplicability,
    pub confidence: f64,
}

impl PatternRule {
    pub fn from_config(rule: &PatternRuleConfig) -> Result<Self> {
        let regex = Regex::new(&rule.pattern)
            .map_err(|e| CascadeError::Config(format!("bad pattern '{}': {}", rule.pattern, e)))?;
        Ok(Self {
            regex,
            severity: rule.severity,
            category: rule.category,
            feasibility: rule.feasibility,
            impact: rule.impact,
            applicability: rule.applicability,
            confidence: rule.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Regex rules over `"{kind}: {message}"`. First match wins.
pub struct PatternClassifier {
    rules: Vec<PatternRule>,
}

impl PatternClassifier {
    pub fn builtin() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }

    /// Config rules first, then the built-in ones.
    pub fn from_config(rules: &[PatternRuleConfig]) -> Result<Self> {
        let mut compiled = rules
            .iter()
            .map(PatternRule::from_config)
            .collect::<Result<Vec<_>>>()?;
        compiled.extend(builtin_rules());
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    fn matching(&self, failure: &FailureReport) -> Option<ErrorClassification> {
        let text = match &failure.error_type {
            Some(t) => format!("{}: {} ({})", failure.kind.as_str(), failure.message, t),
            None => format!("{}: {}", failure.kind.as_str(), failure.message),
        };
        let rule = self.rules.iter().find(|r| r.regex.is_match(&text))?;
        Some(ErrorClassification {
            severity: rule.severity,
            category: rule.category,
            feasibility: rule.feasibility,
            impact: rule.impact,
            applicability: rule.applicability,
            confidence: rule.confidence,
            classifier: "pattern".to_string(),
            reasoning: format!("matched /{}/", rule.regex.as_str()),
        })
    }
}

impl ErrorClassifier for PatternClassifier {
    fn name(&self) -> &str {
        "pattern"
    }

    fn classify<'a>(
        &'a self,
        failure: &'a FailureReport,
    ) -> BoxFuture<'a, Result<Option<ErrorClassification>>> {
        Box::pin(async move { Ok(self.matching(failure)) })
    }
}

fn rule(
    pattern: &str,
    severity: Severity,
    category: ErrorCategory,
    feasibility: RecoveryFeasibility,
    impact: WorkflowImpact,
    applicability: RecoveryApplicability,
    confidence: f64,
) -> Option<PatternRule> {
    Regex::new(pattern).ok().map(|regex| PatternRule {
        regex,
        severity,
        category,
        feasibility,
        impact,
        applicability,
        confidence,
    })
}

fn builtin_rules() -> Vec<PatternRule> {
    use ErrorCategory as C;
    use RecoveryApplicability as A;
    use RecoveryFeasibility as F;
    use Severity as S;
    use WorkflowImpact as I;

    [
        rule(
            r"(?i)(panic|segfault|segmentation fault|internal error|assertion failed|system bug|stack overflow)",
            S::Critical,
            C::SystemBug,
            F::NonRecoverable,
            I::BlocksAll,
            A::RequiresSystemFix,
            0.9,
        ),
        rule(
            r"(?i)(timeout|timed out|rate limit|temporar|connection (reset|refused)|unavailable|\b503\b|\b429\b)",
            S::Minor,
            C::External,
            F::Easily,
            I::BlocksDependent,
            A::FixableByErrorRecovery,
            0.85,
        ),
        rule(
            r"(?i)(out of memory|\boom\b|disk full|no space left|quota|resource exhausted)",
            S::Major,
            C::Resource,
            F::Difficult,
            I::BlocksDependent,
            A::RequiresManualIntervention,
            0.8,
        ),
        rule(
            r"(?i)(permission denied|forbidden|unauthorized|access denied|\b401\b|\b403\b)",
            S::Major,
            C::User,
            F::Difficult,
            I::BlocksDependent,
            A::RequiresManualIntervention,
            0.8,
        ),
        rule(
            r"^handoff_validation:",
            S::Minor,
            C::TaskDecision,
            F::Moderately,
            I::DegradesQuality,
            A::FixableByErrorRecovery,
            0.8,
        ),
        rule(
            r"(?i)(ambiguous|wrong approach|incomplete output|missing field|invalid output)",
            S::Minor,
            C::TaskDecision,
            F::Moderately,
            I::DegradesQuality,
            A::FixableByErrorRecovery,
            0.75,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Asks an LLM for a JSON verdict.
pub struct LlmClassifier {
    client: Arc<dyn LlmClient>,
}

impl LlmClassifier {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl ErrorClassifier for LlmClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    fn classify<'a>(
        &'a self,
        failure: &'a FailureReport,
    ) -> BoxFuture<'a, Result<Option<ErrorClassification>>> {
        Box::pin(async move {
            let response = self.client.complete(classification_prompt(failure)).await?;
            Ok(Some(parse_classification(&response, self.client.name())))
        })
    }
}

fn classification_prompt(failure: &FailureReport) -> String {
    format!(
        r#"Classify this failure of the workflow role "{}".

Error kind: {}
Error type: {}
Retries so far: {}
Message:
{}

Respond with ONLY valid JSON:
{{
  "severity": "trivial" | "minor" | "major" | "critical",
  "category": "system_bug" | "task_decision" | "technical" | "resource" | "logic" | "external" | "user",
  "feasibility": "easily" | "moderately" | "difficult" | "non_recoverable",
  "impact": "blocks_all" | "blocks_dependent" | "degrades_quality" | "no_impact",
  "applicability": "fixable_by_error_recovery" | "requires_system_fix" | "requires_manual_intervention",
  "confidence": 0.0-1.0,
  "reasoning": "brief explanation"
}}"#,
        failure.role,
        failure.kind.as_str(),
        failure.error_type.as_deref().unwrap_or("unknown"),
        failure.retry_count,
        failure.message,
    )
}

#[derive(Deserialize)]
struct LlmVerdict {
    severity: Severity,
    category: ErrorCategory,
    feasibility: RecoveryFeasibility,
    #[serde(default = "default_impact")]
    impact: WorkflowImpact,
    applicability: RecoveryApplicability,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_impact() -> WorkflowImpact {
    WorkflowImpact::BlocksDependent
}

/// Parse the LLM's JSON verdict; fall back to keyword heuristics on the raw text.
pub(crate) fn parse_classification(response: &str, model: &str) -> ErrorClassification {
    let json = strip_code_fences(response);
    match serde_json::from_str::<LlmVerdict>(&json) {
        Ok(v) => ErrorClassification {
            severity: v.severity,
            category: v.category,
            feasibility: v.feasibility,
            impact: v.impact,
            applicability: v.applicability,
            confidence: v.confidence.clamp(0.0, 1.0),
            classifier: format!("llm:{}", model),
            reasoning: v.reasoning,
        },
        Err(e) => {
            warn!(error = %e, "Failed to parse LLM classification, using heuristics");
            heuristic_classification(response, model)
        }
    }
}

fn heuristic_classification(text: &str, model: &str) -> ErrorClassification {
    let lower = text.to_lowercase();
    let (severity, category, feasibility, applicability) = if lower.contains("system")
        || lower.contains("critical")
    {
        (
            Severity::Critical,
            ErrorCategory::SystemBug,
            RecoveryFeasibility::NonRecoverable,
            RecoveryApplicability::RequiresSystemFix,
        )
    } else if lower.contains("retry") || lower.contains("transient") || lower.contains("network") {
        (
            Severity::Minor,
            ErrorCategory::External,
            RecoveryFeasibility::Easily,
            RecoveryApplicability::FixableByErrorRecovery,
        )
    } else if lower.contains("decision") || lower.contains("approach") {
        (
            Severity::Minor,
            ErrorCategory::TaskDecision,
            RecoveryFeasibility::Moderately,
            RecoveryApplicability::FixableByErrorRecovery,
        )
    } else {
        (
            Severity::Major,
            ErrorCategory::Technical,
            RecoveryFeasibility::Moderately,
            RecoveryApplicability::RequiresManualIntervention,
        )
    };

    ErrorClassification {
        severity,
        category,
        feasibility,
        impact: WorkflowImpact::BlocksDependent,
        applicability,
        confidence: 0.5,
        classifier: format!("llm:{}", model),
        reasoning: "keyword heuristics on unparseable response".to_string(),
    }
}

/// Strip markdown code fences (```json ... ```) from an LLM response.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Last resort. Always answers, with low confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    pub(crate) fn fallback(&self, failure: &FailureReport) -> ErrorClassification {
        ErrorClassification {
            severity: Severity::Major,
            category: ErrorCategory::Technical,
            feasibility: RecoveryFeasibility::Moderately,
            impact: WorkflowImpact::BlocksDependent,
            applicability: RecoveryApplicability::RequiresManualIntervention,
            confidence: 0.3,
            classifier: "default".to_string(),
            reasoning: format!("no classifier recognized: {}", failure.message),
        }
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn name(&self) -> &str {
        "default"
    }

    fn classify<'a>(
        &'a self,
        failure: &'a FailureReport,
    ) -> BoxFuture<'a, Result<Option<ErrorClassification>>> {
        Box::pin(async move { Ok(Some(self.fallback(failure))) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::types::{ErrorKind, WorkflowId};

    struct CannedLlm(String);

    impl LlmClient for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }

        fn complete(&self, _prompt: String) -> BoxFuture<'_, Result<String>> {
            let text = self.0.clone();
            Box::pin(async move { Ok(text) })
        }
    }

    fn report(kind: ErrorKind, message: &str) -> FailureReport {
        FailureReport::new(WorkflowId::from_str("wf-c"), "coder", kind, message)
    }

    #[tokio::test]
    async fn test_pattern_rules() {
        let c = PatternClassifier::builtin();
        let cases = [
            ("segfault in worker", ErrorCategory::SystemBug),
            ("HTTP 429 Too Many Requests", ErrorCategory::External),
            ("Connection refused", ErrorCategory::External),
            ("out of memory", ErrorCategory::Resource),
            ("Permission denied: /etc", ErrorCategory::User),
            ("the request was ambiguous", ErrorCategory::TaskDecision),
        ];
        for (msg, expected) in cases {
            let got = c
                .classify(&report(ErrorKind::RoleExecution, msg))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.category, expected, "{}", msg);
        }
        assert!(c
            .classify(&report(ErrorKind::RoleExecution, "it broke"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_handoff_kind_rule() {
        let c = PatternClassifier::builtin();
        let got = c
            .classify(&report(ErrorKind::HandoffValidation, "fields absent: code_files"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.category, ErrorCategory::TaskDecision);
        assert_eq!(got.applicability, RecoveryApplicability::FixableByErrorRecovery);
    }

    #[tokio::test]
    async fn test_config_rules_take_precedence() {
        let rules = vec![PatternRuleConfig {
            pattern: "(?i)timeout".into(),
            severity: Severity::Major,
            category: ErrorCategory::Resource,
            feasibility: RecoveryFeasibility::Difficult,
            impact: WorkflowImpact::BlocksAll,
            applicability: RecoveryApplicability::RequiresManualIntervention,
            confidence: 0.9,
        }];
        let c = PatternClassifier::from_config(&rules).unwrap();
        let got = c
            .classify(&report(ErrorKind::RoleExecution, "Timeout"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.category, ErrorCategory::Resource);
        assert_eq!(c.rules().len(), builtin_rules().len() + 1);
    }

    #[test]
    fn test_bad_config_pattern() {
        let rules = vec![PatternRuleConfig {
            pattern: "(unclosed".into(),
            severity: Severity::Minor,
            category: ErrorCategory::Logic,
            feasibility: RecoveryFeasibility::Easily,
            impact: WorkflowImpact::NoImpact,
            applicability: RecoveryApplicability::FixableByErrorRecovery,
            confidence: 0.8,
        }];
        assert!(matches!(
            PatternClassifier::from_config(&rules),
            Err(CascadeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_json_verdict_in_fences() {
        let llm = CannedLlm(
            "Here you go:\n```json\n{\"severity\":\"minor\",\"category\":\"logic\",\
             \"feasibility\":\"easily\",\"applicability\":\"fixable_by_error_recovery\",\
             \"confidence\":0.82,\"reasoning\":\"off by one\"}\n```"
                .into(),
        );
        let c = LlmClassifier::new(Arc::new(llm));
        let got = c
            .classify(&report(ErrorKind::RoleExecution, "wrong total"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.category, ErrorCategory::Logic);
        assert_eq!(got.impact, WorkflowImpact::BlocksDependent);
        assert_eq!(got.confidence, 0.82);
        assert_eq!(got.classifier, "llm:canned");
    }

    #[test]
    fn test_llm_heuristic_fallback() {
        let got = parse_classification("Looks like a transient network blip", "m");
        assert_eq!(got.category, ErrorCategory::External);
        assert_eq!(got.confidence, 0.5);

        let got = parse_classification("no idea", "m");
        assert_eq!(got.applicability, RecoveryApplicability::RequiresManualIntervention);
    }

    #[tokio::test]
    async fn test_default_always_answers() {
        let got = DefaultClassifier
            .classify(&report(ErrorKind::System, "x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.severity, Severity::Major);
        assert_eq!(got.feasibility, RecoveryFeasibility::Moderately);
        assert_eq!(got.confidence, 0.3);
    }
}
