use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cascade_core::classification::{ErrorCategory, RecoveryFeasibility, Severity};

use super::{ErrorClassification, RecoveryAction, RecoveryDecision, RecoveryStrategy, RiskLevel};
use crate::dependency::FailureImpact;

/// Rule-based strategies, best first, at most `max` of them.
pub fn generate_strategies(
    classification: &ErrorClassification,
    impact: &FailureImpact,
    max: usize,
) -> Vec<RecoveryStrategy> {
    let manual = RecoveryStrategy {
        action: RecoveryAction::ManualIntervention,
        feasibility: 0.9,
        risk: RiskLevel::Low,
        success_probability: 0.8,
        description: "Pause the workflow for a human to resolve".to_string(),
    };
    if classification.is_system_level() || classification.manual_only() {
        return vec![manual];
    }

    let mut candidates = Vec::new();

    let base = match classification.feasibility {
        RecoveryFeasibility::Easily => Some(0.7),
        RecoveryFeasibility::Moderately => Some(0.5),
        _ => None,
    };
    if let Some(base) = base {
        let bonus = if classification.category == ErrorCategory::External {
            0.15
        } else {
            0.0
        };
        candidates.push(RecoveryStrategy {
            action: RecoveryAction::Retry,
            feasibility: f64::min(base + bonus, 1.0),
            risk: if classification.severity <= Severity::Minor {
                RiskLevel::Low
            } else {
                RiskLevel::Medium
            },
            success_probability: 0.6,
            description: format!("Re-run '{}' from scratch", impact.failed_role),
        });
    }

    if impact.blocked.is_empty() {
        candidates.push(RecoveryStrategy {
            action: RecoveryAction::Skip,
            feasibility: 0.8,
            risk: RiskLevel::Medium,
            success_probability: 0.7,
            description: format!("Skip '{}'; no remaining role depends on it", impact.failed_role),
        });
    }

    if let Some(role) = impact.replacements.first() {
        candidates.push(RecoveryStrategy {
            action: RecoveryAction::Replace { role: role.clone() },
            feasibility: 0.75,
            risk: RiskLevel::Medium,
            success_probability: 0.65,
            description: format!("Run '{}' in place of '{}'", role, impact.failed_role),
        });
    }

    candidates.push(manual);

    // One strategy per action kind, highest feasibility wins
    let mut strategies: Vec<RecoveryStrategy> = Vec::new();
    for s in candidates {
        match strategies
            .iter_mut()
            .find(|e| e.action.as_str() == s.action.as_str())
        {
            Some(existing) if existing.feasibility < s.feasibility => *existing = s,
            Some(_) => {}
            None => strategies.push(s),
        }
    }
    strategies.sort_by(|a, b| b.feasibility.total_cmp(&a.feasibility));
    strategies.truncate(max.max(1));
    strategies
}

/// Weighted score used to rank eligible strategies.
pub fn strategy_score(s: &RecoveryStrategy) -> f64 {
    0.5 * s.feasibility + 0.3 * s.success_probability + 0.2 * (1.0 - s.risk.weight())
}

/// Pick an automatic action, or fall back to manual intervention.
pub fn decide(
    classification: &ErrorClassification,
    strategies: &[RecoveryStrategy],
) -> RecoveryDecision {
    let manual = |rationale: String| RecoveryDecision {
        action: RecoveryAction::ManualIntervention,
        automatic: false,
        strategy: strategies
            .iter()
            .find(|s| s.action == RecoveryAction::ManualIntervention)
            .cloned(),
        classification: classification.clone(),
        rationale,
    };

    if classification.is_system_level() {
        return manual(format!(
            "system-level error ({}) needs a system fix",
            classification.category
        ));
    }
    if classification.manual_only() {
        return manual("classification requires manual intervention".to_string());
    }
    if classification.severity >= Severity::Major {
        return manual(format!("severity {} is too high", classification.severity));
    }
    if matches!(
        classification.feasibility,
        RecoveryFeasibility::Difficult | RecoveryFeasibility::NonRecoverable
    ) {
        return manual(format!(
            "recovery feasibility is {}",
            classification.feasibility.as_str()
        ));
    }

    let best = strategies
        .iter()
        .filter(|s| s.action != RecoveryAction::ManualIntervention)
        .filter(|s| s.feasibility > 0.7 && s.risk != RiskLevel::High)
        .max_by(|a, b| strategy_score(a).total_cmp(&strategy_score(b)));

    match best {
        Some(s) => RecoveryDecision {
            action: s.action.clone(),
            automatic: true,
            strategy: Some(s.clone()),
            classification: classification.clone(),
            rationale: format!("{} (score {:.2})", s.description, strategy_score(s)),
        },
        None => manual("no automatic strategy is feasible enough".to_string()),
    }
}

/// Memo key over the fields strategy generation depends on.
pub(crate) fn cache_key(classification: &ErrorClassification, impact: &FailureImpact) -> u64 {
    let mut hasher = DefaultHasher::new();
    classification.severity.hash(&mut hasher);
    classification.category.hash(&mut hasher);
    classification.feasibility.hash(&mut hasher);
    classification.impact.hash(&mut hasher);
    classification.applicability.hash(&mut hasher);
    impact.failed_role.hash(&mut hasher);
    impact.blocked.is_empty().hash(&mut hasher);
    impact.replacements.first().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::ImpactLevel;
    use cascade_core::classification::{RecoveryApplicability, WorkflowImpact};

    fn classification(
        severity: Severity,
        category: ErrorCategory,
        feasibility: RecoveryFeasibility,
    ) -> ErrorClassification {
        ErrorClassification {
            severity,
            category,
            feasibility,
            impact: WorkflowImpact::BlocksDependent,
            applicability: RecoveryApplicability::FixableByErrorRecovery,
            confidence: 0.9,
            classifier: "test".into(),
            reasoning: String::new(),
        }
    }

    fn impact(blocked: bool, replacement: Option<&str>) -> FailureImpact {
        FailureImpact {
            failed_role: "coder".into(),
            blocked: if blocked { vec!["tester".into()] } else { vec![] },
            degraded: vec![],
            unaffected: vec![],
            level: ImpactLevel::Minor,
            recovery_options: vec![],
            estimated_delay_minutes: 30,
            replacements: replacement.map(|r| vec![r.to_string()]).unwrap_or_default(),
        }
    }

    fn actions(strategies: &[RecoveryStrategy]) -> Vec<&'static str> {
        strategies.iter().map(|s| s.action.as_str()).collect()
    }

    #[test]
    fn test_all_strategies_sorted_by_feasibility() {
        let c = classification(Severity::Minor, ErrorCategory::External, RecoveryFeasibility::Easily);
        let s = generate_strategies(&c, &impact(false, Some("backup")), 5);
        assert_eq!(actions(&s), vec!["manual_intervention", "retry", "skip", "replace"]);
        assert!((s[1].feasibility - 0.85).abs() < 1e-9);
        assert_eq!(s[1].risk, RiskLevel::Low);
    }

    #[test]
    fn test_blocked_role_cannot_be_skipped() {
        let c = classification(Severity::Minor, ErrorCategory::Logic, RecoveryFeasibility::Difficult);
        let s = generate_strategies(&c, &impact(true, None), 5);
        assert_eq!(actions(&s), vec!["manual_intervention"]);
    }

    #[test]
    fn test_cap() {
        let c = classification(Severity::Minor, ErrorCategory::External, RecoveryFeasibility::Easily);
        let s = generate_strategies(&c, &impact(false, Some("backup")), 2);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_system_level_only_manual() {
        let c = ErrorClassification::system_level("test", "boom");
        let s = generate_strategies(&c, &impact(false, Some("backup")), 5);
        assert_eq!(actions(&s), vec!["manual_intervention"]);
    }

    #[test]
    fn test_system_level_is_manual_regardless_of_strategies() {
        let c = ErrorClassification::system_level("test", "boom");
        let tempting = vec![RecoveryStrategy {
            action: RecoveryAction::Retry,
            feasibility: 1.0,
            risk: RiskLevel::Low,
            success_probability: 1.0,
            description: "retry".into(),
        }];
        let d = decide(&c, &tempting);
        assert_eq!(d.action, RecoveryAction::ManualIntervention);
        assert!(!d.automatic);
    }

    #[test]
    fn test_major_severity_is_manual() {
        let c = classification(Severity::Major, ErrorCategory::External, RecoveryFeasibility::Easily);
        let s = generate_strategies(&c, &impact(false, None), 5);
        let d = decide(&c, &s);
        assert_eq!(d.action, RecoveryAction::ManualIntervention);
    }

    #[test]
    fn test_retry_outranks_skip() {
        let c = classification(Severity::Minor, ErrorCategory::External, RecoveryFeasibility::Easily);
        let s = generate_strategies(&c, &impact(false, None), 5);
        let d = decide(&c, &s);
        assert_eq!(d.action, RecoveryAction::Retry);
        assert!(d.automatic);
    }

    #[test]
    fn test_nothing_feasible_enough() {
        // retry 0.5, no skip (blocked), no replacement
        let c = classification(Severity::Minor, ErrorCategory::Logic, RecoveryFeasibility::Moderately);
        let s = generate_strategies(&c, &impact(true, None), 5);
        let d = decide(&c, &s);
        assert_eq!(d.action, RecoveryAction::ManualIntervention);
        assert!(d.strategy.is_some());
    }

    #[test]
    fn test_score_weights() {
        let s = RecoveryStrategy {
            action: RecoveryAction::Skip,
            feasibility: 0.8,
            risk: RiskLevel::Medium,
            success_probability: 0.7,
            description: String::new(),
        };
        assert!((strategy_score(&s) - 0.71).abs() < 1e-9);
    }

    #[test]
    fn test_cache_key_stable() {
        let c = classification(Severity::Minor, ErrorCategory::External, RecoveryFeasibility::Easily);
        let i = impact(false, None);
        assert_eq!(cache_key(&c, &i), cache_key(&c.clone(), &i.clone()));
        assert_ne!(cache_key(&c, &i), cache_key(&c, &impact(true, None)));
    }
}
