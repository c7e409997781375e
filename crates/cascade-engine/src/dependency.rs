use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cascade_core::catalog::{Capability, RoleCatalog};

/// Dependency edges for a single role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub strong: Vec<String>,
    pub weak: Vec<String>,
    /// Roles that depend (strongly or weakly) on this one.
    pub feeds: Vec<String>,
}

/// A problem found while validating a role sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyIssue {
    UnknownRole { role: String },
    MissingStrong { role: String, dependency: String },
    StrongOutOfOrder { role: String, dependency: String },
    WeakOutOfOrder { role: String, dependency: String },
}

impl std::fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRole { role } => write!(f, "unknown role '{}'", role),
            Self::MissingStrong { role, dependency } => write!(
                f,
                "role '{}' strongly depends on '{}', which is not in the sequence",
                role, dependency
            ),
            Self::StrongOutOfOrder { role, dependency } => write!(
                f,
                "role '{}' strongly depends on '{}', which must come before it",
                role, dependency
            ),
            Self::WeakOutOfOrder { role, dependency } => write!(
                f,
                "role '{}' weakly depends on '{}', which should come before it",
                role, dependency
            ),
        }
    }
}

/// Result of `validate_sequence`: hard errors and advisory warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceValidation {
    pub errors: Vec<DependencyIssue>,
    pub warnings: Vec<DependencyIssue>,
}

impl SequenceValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// True when every error is an ordering problem that reordering can fix.
    pub fn only_order_errors(&self) -> bool {
        !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|e| matches!(e, DependencyIssue::StrongOutOfOrder { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Minor,
    Moderate,
    Critical,
}

/// Effect of a role failure on the roles still to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureImpact {
    pub failed_role: String,
    /// Remaining roles that strongly depend on the failed role.
    pub blocked: Vec<String>,
    /// Remaining roles that weakly depend on the failed role.
    pub degraded: Vec<String>,
    pub unaffected: Vec<String>,
    pub level: ImpactLevel,
    pub recovery_options: Vec<String>,
    pub estimated_delay_minutes: u32,
    /// Compatible replacements for the failed role, best first.
    #[serde(default)]
    pub replacements: Vec<String>,
}

/// A catalog role similar enough to stand in for another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibleRole {
    pub role: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPathAnalysis {
    pub critical: Vec<String>,
    pub optional: Vec<String>,
    pub violations: Vec<DependencyIssue>,
    pub execution_order: Vec<String>,
    pub parallel_groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyStats {
    pub total_roles: usize,
    pub total_strong: usize,
    pub total_weak: usize,
    pub average_strong_per_role: f64,
    /// Role with the most strong dependencies.
    pub most_dependent: Option<String>,
    /// Role most often named as a strong dependency.
    pub most_depended_on: Option<String>,
}

/// Static dependency graph over a role catalog.
pub struct DependencyAnalyzer {
    catalog: Arc<RoleCatalog>,
    graph: HashMap<String, DependencyNode>,
    similarity_threshold: f64,
}

impl DependencyAnalyzer {
    pub fn new(catalog: Arc<RoleCatalog>) -> Self {
        let mut graph: HashMap<String, DependencyNode> = catalog
            .roles()
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    DependencyNode {
                        strong: r.strong_dependencies.clone(),
                        weak: r.weak_dependencies.clone(),
                        feeds: vec![],
                    },
                )
            })
            .collect();

        for role in catalog.roles() {
            for dep in role.strong_dependencies.iter().chain(&role.weak_dependencies) {
                if let Some(node) = graph.get_mut(dep) {
                    if !node.feeds.contains(&role.id) {
                        node.feeds.push(role.id.clone());
                    }
                }
            }
        }

        Self {
            catalog,
            graph,
            similarity_threshold: 0.6,
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn catalog(&self) -> &Arc<RoleCatalog> {
        &self.catalog
    }

    pub fn node(&self, role: &str) -> Option<&DependencyNode> {
        self.graph.get(role)
    }

    fn strong(&self, role: &str) -> &[String] {
        self.graph.get(role).map(|n| n.strong.as_slice()).unwrap_or(&[])
    }

    fn weak(&self, role: &str) -> &[String] {
        self.graph.get(role).map(|n| n.weak.as_slice()).unwrap_or(&[])
    }

    /// Check that strong dependencies precede their dependents (errors) and
    /// weak ones preferably do too (warnings).
    pub fn validate_sequence(&self, roles: &[String]) -> SequenceValidation {
        let mut result = SequenceValidation::default();
        let position: HashMap<&str, usize> = roles
            .iter()
            .enumerate()
            .rev()
            .map(|(i, r)| (r.as_str(), i))
            .collect();

        for (i, role) in roles.iter().enumerate() {
            if !self.graph.contains_key(role) {
                result.errors.push(DependencyIssue::UnknownRole { role: role.clone() });
                continue;
            }

            for dep in self.strong(role) {
                match position.get(dep.as_str()) {
                    None => result.errors.push(DependencyIssue::MissingStrong {
                        role: role.clone(),
                        dependency: dep.clone(),
                    }),
                    Some(&j) if j > i => result.errors.push(DependencyIssue::StrongOutOfOrder {
                        role: role.clone(),
                        dependency: dep.clone(),
                    }),
                    Some(_) => {}
                }
            }

            for dep in self.weak(role) {
                if let Some(&j) = position.get(dep.as_str()) {
                    if j > i {
                        result.warnings.push(DependencyIssue::WeakOutOfOrder {
                            role: role.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        debug!(
            roles = roles.len(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Validated role sequence"
        );
        result
    }

    /// Stable topological order over the strong dependencies among `roles`.
    ///
    /// Ready roles are emitted in input order. Dependencies on roles outside
    /// the sequence are ignored. Roles caught in a cycle are appended in
    /// input order, so the result always contains every input role.
    pub fn adjust_sequence(&self, roles: &[String]) -> Vec<String> {
        let members: HashSet<&str> = roles.iter().map(|r| r.as_str()).collect();
        let mut remaining: Vec<usize> = (0..roles.len()).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(roles.len());

        loop {
            let ready = remaining.iter().position(|&i| {
                self.strong(&roles[i])
                    .iter()
                    .filter(|d| members.contains(d.as_str()) && d.as_str() != roles[i])
                    .all(|d| placed.contains(d.as_str()))
            });
            match ready {
                Some(pos) => {
                    let i = remaining.remove(pos);
                    placed.insert(roles[i].as_str());
                    order.push(roles[i].clone());
                }
                None => break,
            }
        }

        if !remaining.is_empty() {
            debug!(
                unresolved = remaining.len(),
                "Dependency cycle detected, appending remainder in input order"
            );
            order.extend(remaining.into_iter().map(|i| roles[i].clone()));
        }
        order
    }

    /// Partition `remaining` by how they depend on `failed`.
    pub fn assess_failure_impact(&self, failed: &str, remaining: &[String]) -> FailureImpact {
        self.assess(failed, &[failed], remaining)
    }

    /// Impact of a substitute failing in place of `original`. Roles that
    /// depend on either one are affected, and candidates for both are offered.
    pub fn assess_substitute_failure(
        &self,
        failed: &str,
        original: &str,
        remaining: &[String],
    ) -> FailureImpact {
        self.assess(failed, &[failed, original], remaining)
    }

    fn assess(&self, failed: &str, covers: &[&str], remaining: &[String]) -> FailureImpact {
        let mut blocked = Vec::new();
        let mut degraded = Vec::new();
        let mut unaffected = Vec::new();
        let covered = |deps: &[String]| deps.iter().any(|d| covers.contains(&d.as_str()));

        for role in remaining {
            if covered(self.strong(role)) {
                blocked.push(role.clone());
            } else if covered(self.weak(role)) {
                degraded.push(role.clone());
            } else {
                unaffected.push(role.clone());
            }
        }

        let level = if !blocked.is_empty() {
            ImpactLevel::Critical
        } else if !degraded.is_empty() {
            ImpactLevel::Moderate
        } else {
            ImpactLevel::Minor
        };

        let mut replacements: Vec<String> = Vec::new();
        for role in covers.iter().rev() {
            for candidate in self.find_compatible_roles(role) {
                if !covers.contains(&candidate.role.as_str())
                    && !replacements.contains(&candidate.role)
                {
                    replacements.push(candidate.role);
                }
            }
        }

        let mut recovery_options = vec!["retry".to_string()];
        if blocked.is_empty() {
            recovery_options.push("skip".to_string());
        }
        if !replacements.is_empty() {
            recovery_options.push("replace".to_string());
        }
        recovery_options.push("manual_intervention".to_string());
        if !blocked.is_empty() {
            recovery_options.push("modify_workflow".to_string());
        }

        let estimated_delay_minutes = self.estimate_delay(failed, blocked.len(), degraded.len());

        FailureImpact {
            failed_role: failed.to_string(),
            blocked,
            degraded,
            unaffected,
            level,
            recovery_options,
            estimated_delay_minutes,
            replacements,
        }
    }

    fn estimate_delay(&self, failed: &str, blocked: usize, degraded: usize) -> u32 {
        const BASE_MINUTES: f64 = 30.0;
        let mut multiplier = 1.0 + blocked as f64 * 0.5 + degraded as f64 * 0.2;
        // Roles that others strongly need hold up more of the pipeline
        let feeds_strong = self
            .graph
            .values()
            .any(|n| n.strong.iter().any(|d| d == failed));
        if feeds_strong {
            multiplier *= 1.5;
        }
        (BASE_MINUTES * multiplier) as u32
    }

    /// Catalog roles whose capability overlaps `failed` above the threshold.
    pub fn find_compatible_roles(&self, failed: &str) -> Vec<CompatibleRole> {
        let Some(target) = self.catalog.get(failed) else {
            return vec![];
        };

        let mut found: Vec<CompatibleRole> = self
            .catalog
            .roles()
            .iter()
            .filter(|r| r.id != failed)
            .filter_map(|r| {
                let similarity = capability_similarity(&target.capability, &r.capability);
                (similarity > self.similarity_threshold).then(|| CompatibleRole {
                    role: r.id.clone(),
                    similarity,
                })
            })
            .collect();

        // Stable sort keeps catalog order among equals
        found.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        found
    }

    /// Critical roles, ordering violations, suggested order and parallel groups.
    pub fn analyze_critical_path(&self, roles: &[String]) -> CriticalPathAnalysis {
        let mut critical = Vec::new();
        let mut optional = Vec::new();

        for role in roles {
            let depended_on = roles
                .iter()
                .any(|other| other != role && self.strong(other).contains(role));
            if depended_on || self.strong(role).is_empty() {
                critical.push(role.clone());
            } else {
                optional.push(role.clone());
            }
        }

        let violations = self.validate_sequence(roles).errors;

        CriticalPathAnalysis {
            critical,
            optional,
            violations,
            execution_order: self.adjust_sequence(roles),
            parallel_groups: self.parallel_groups(roles),
        }
    }

    /// For each role, the later roles that could run alongside it.
    pub fn parallel_groups(&self, roles: &[String]) -> Vec<Vec<String>> {
        let mut groups = Vec::new();
        for i in 0..roles.len() {
            let mut group = vec![roles[i].clone()];
            for j in (i + 1)..roles.len() {
                if self.can_run_parallel(i, j, roles) {
                    group.push(roles[j].clone());
                }
            }
            if group.len() > 1 {
                groups.push(group);
            }
        }
        groups
    }

    fn can_run_parallel(&self, i: usize, j: usize, roles: &[String]) -> bool {
        let (a, b) = (&roles[i], &roles[j]);
        let linked = |x: &str, y: &str| {
            self.strong(y).iter().any(|d| d == x) || self.weak(y).iter().any(|d| d == x)
        };
        if linked(a, b) || linked(b, a) {
            return false;
        }

        // A shared strong dependency placed after either role forces ordering
        let first = i.min(j);
        for dep in self.strong(a) {
            if !self.strong(b).contains(dep) {
                continue;
            }
            if let Some(pos) = roles.iter().position(|r| r == dep) {
                if pos > first {
                    return false;
                }
            }
        }
        true
    }

    /// Alternative sequences after `failed` fails: skip it, replace it, or
    /// reorder the rest. Only paths that validate are returned.
    pub fn alternative_paths(&self, failed: &str, sequence: &[String]) -> Vec<Vec<String>> {
        let mut paths = Vec::new();

        let skip: Vec<String> = sequence.iter().filter(|r| *r != failed).cloned().collect();
        if self.validate_sequence(&skip).is_valid() {
            paths.push(skip.clone());
        }

        if let Some(idx) = sequence.iter().position(|r| r == failed) {
            for candidate in self.find_compatible_roles(failed) {
                let mut path = sequence.to_vec();
                path[idx] = candidate.role;
                if self.validate_sequence(&path).is_valid() {
                    paths.push(path);
                }
            }
        }

        if sequence.len() > 2 {
            let reordered = self.adjust_sequence(&skip);
            if reordered != skip && self.validate_sequence(&reordered).is_valid() {
                paths.push(reordered);
            }
        }

        paths
    }

    pub fn stats(&self) -> DependencyStats {
        let total_roles = self.catalog.len();
        let total_strong: usize = self.graph.values().map(|n| n.strong.len()).sum();
        let total_weak: usize = self.graph.values().map(|n| n.weak.len()).sum();

        let most_dependent = self
            .catalog
            .roles()
            .iter()
            .filter(|r| !r.strong_dependencies.is_empty())
            .max_by_key(|r| r.strong_dependencies.len())
            .map(|r| r.id.clone());

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for role in self.catalog.roles() {
            for dep in &role.strong_dependencies {
                *counts.entry(dep.as_str()).or_default() += 1;
            }
        }
        let most_depended_on = self
            .catalog
            .roles()
            .iter()
            .filter_map(|r| counts.get(r.id.as_str()).map(|c| (r.id.clone(), *c)))
            .max_by_key(|(_, c)| *c)
            .map(|(id, _)| id);

        DependencyStats {
            total_roles,
            total_strong,
            total_weak,
            average_strong_per_role: total_strong as f64 / total_roles.max(1) as f64,
            most_dependent,
            most_depended_on,
        }
    }

    /// Plain-text listing of the graph in catalog order.
    pub fn render(&self) -> String {
        let mut lines = vec!["# Role dependencies".to_string(), String::new()];
        for role in self.catalog.roles() {
            let Some(node) = self.graph.get(&role.id) else {
                continue;
            };
            lines.push(format!("## {}", role.id));
            if !node.strong.is_empty() {
                lines.push(format!("  strong: {}", node.strong.join(", ")));
            }
            if !node.weak.is_empty() {
                lines.push(format!("  weak: {}", node.weak.join(", ")));
            }
            if !node.feeds.is_empty() {
                lines.push(format!("  feeds: {}", node.feeds.join(", ")));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

/// Weighted Jaccard similarity: domains 50%, sub-domains 30%, outputs 20%.
pub fn capability_similarity(a: &Capability, b: &Capability) -> f64 {
    jaccard(&a.domains, &b.domains) * 0.5
        + jaccard(&a.sub_domains, &b.sub_domains) * 0.3
        + jaccard(&a.output_types, &b.output_types) * 0.2
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let b: HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}
