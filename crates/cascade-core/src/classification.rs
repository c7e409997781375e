use serde::{Deserialize, Serialize};

/// How bad a role failure is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trivial,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Defect in the system itself; never handled automatically.
    SystemBug,
    /// The role made a poor decision; safe to retry, skip or replace.
    TaskDecision,
    Technical,
    Resource,
    Logic,
    External,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryFeasibility {
    Easily,
    Moderately,
    Difficult,
    NonRecoverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowImpact {
    BlocksAll,
    BlocksDependent,
    DegradesQuality,
    NoImpact,
}

/// Who can fix the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryApplicability {
    FixableByErrorRecovery,
    RequiresSystemFix,
    RequiresManualIntervention,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemBug => "system_bug",
            Self::TaskDecision => "task_decision",
            Self::Technical => "technical",
            Self::Resource => "resource",
            Self::Logic => "logic",
            Self::External => "external",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RecoveryFeasibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easily => "easily",
            Self::Moderately => "moderately",
            Self::Difficult => "difficult",
            Self::NonRecoverable => "non_recoverable",
        }
    }
}

impl WorkflowImpact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlocksAll => "blocks_all",
            Self::BlocksDependent => "blocks_dependent",
            Self::DegradesQuality => "degrades_quality",
            Self::NoImpact => "no_impact",
        }
    }
}

impl RecoveryApplicability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixableByErrorRecovery => "fixable_by_error_recovery",
            Self::RequiresSystemFix => "requires_system_fix",
            Self::RequiresManualIntervention => "requires_manual_intervention",
        }
    }
}
