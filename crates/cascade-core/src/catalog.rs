use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a role can do, used for replacement matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub output_types: Vec<String>,
}

/// A role in the catalog: identity, capability, and declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capability: Capability,
    /// Roles that must run before this one.
    #[serde(default)]
    pub strong_dependencies: Vec<String>,
    /// Roles that should preferably run before this one.
    #[serde(default)]
    pub weak_dependencies: Vec<String>,
    /// Terms used to judge handoff relevance for this role.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl RoleDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            capability: Capability::default(),
            strong_dependencies: vec![],
            weak_dependencies: vec![],
            keywords: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domains(mut self, domains: &[&str]) -> Self {
        self.capability.domains = domains.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_sub_domains(mut self, sub_domains: &[&str]) -> Self {
        self.capability.sub_domains = sub_domains.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_output_types(mut self, output_types: &[&str]) -> Self {
        self.capability.output_types = output_types.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_strong(mut self, deps: &[&str]) -> Self {
        self.strong_dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_weak(mut self, deps: &[&str]) -> Self {
        self.weak_dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Read-only registry of roles. Injected into the analyzer and engine.
#[derive(Debug, Clone, Default)]
pub struct RoleCatalog {
    roles: Vec<RoleDefinition>,
    index: HashMap<String, usize>,
}

impl RoleCatalog {
    pub fn new(roles: Vec<RoleDefinition>) -> Self {
        let mut catalog = Self::default();
        for role in roles {
            catalog.upsert(role);
        }
        catalog
    }

    /// The built-in expert roles.
    pub fn builtin() -> Self {
        Self::new(builtin_roles())
    }

    /// Built-in roles with `overrides` replacing same-id entries and
    /// appending new ones.
    pub fn builtin_with(overrides: Vec<RoleDefinition>) -> Self {
        let mut catalog = Self::builtin();
        for role in overrides {
            catalog.upsert(role);
        }
        catalog
    }

    fn upsert(&mut self, role: RoleDefinition) {
        match self.index.get(&role.id) {
            Some(&i) => self.roles[i] = role,
            None => {
                self.index.insert(role.id.clone(), self.roles.len());
                self.roles.push(role);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&RoleDefinition> {
        self.index.get(id).map(|&i| &self.roles[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Roles in registration order.
    pub fn roles(&self) -> &[RoleDefinition] {
        &self.roles
    }

    pub fn ids(&self) -> Vec<&str> {
        self.roles.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

fn builtin_roles() -> Vec<RoleDefinition> {
    vec![
        RoleDefinition::new("planner")
            .with_name("Solution Architect")
            .with_description("Turns requirements into architecture, specs and plans")
            .with_domains(&["software_development"])
            .with_sub_domains(&["architecture", "planning", "analysis", "design"])
            .with_output_types(&["specifications", "architecture", "plans", "diagrams"])
            .with_keywords(&["requirement", "architecture", "design", "plan"]),
        RoleDefinition::new("coder")
            .with_name("Coding Expert")
            .with_description("Implements features and fixes from a design")
            .with_domains(&["software_development"])
            .with_sub_domains(&["implementation", "development", "coding", "debugging"])
            .with_output_types(&["code", "features", "fixes", "configurations"])
            .with_strong(&["planner"])
            .with_keywords(&["architecture", "spec", "design", "constraint"]),
        RoleDefinition::new("data_analyst")
            .with_name("Data Analyst")
            .with_description("Processes data and extracts statistical insights")
            .with_domains(&["data_analysis"])
            .with_sub_domains(&["statistics", "data_processing", "pattern_recognition", "visualization"])
            .with_output_types(&["insights", "reports", "visualizations", "models"])
            .with_weak(&["doc_reader"])
            .with_keywords(&["data", "dataset", "metric"]),
        RoleDefinition::new("stock_analyst")
            .with_name("Financial Analyst")
            .with_description("Evaluates markets, investments and risk")
            .with_domains(&["financial_analysis"])
            .with_sub_domains(&["financial_analysis", "market_research", "investment_evaluation", "risk_assessment"])
            .with_output_types(&["investment_reports", "market_analysis", "risk_assessments", "recommendations"])
            .with_weak(&["data_analyst", "researcher"])
            .with_keywords(&["market", "financial", "risk"]),
        RoleDefinition::new("tech_writer")
            .with_name("Technical Writer")
            .with_description("Produces documents, manuals and reports")
            .with_domains(&["technical_writing"])
            .with_sub_domains(&["technical_writing", "documentation", "content_structuring", "report_writing"])
            .with_output_types(&["documents", "manuals", "guides", "reports", "presentations"])
            .with_weak(&["data_analyst", "stock_analyst", "researcher", "doc_reader"])
            .with_keywords(&["findings", "report", "summary"]),
        RoleDefinition::new("doc_reader")
            .with_name("Document Reader")
            .with_description("Extracts and summarizes information from documents")
            .with_domains(&["information_processing"])
            .with_sub_domains(&["document_analysis", "information_extraction", "summarization", "content_analysis"])
            .with_output_types(&["summaries", "key_insights", "structured_information", "extracted_data"])
            .with_keywords(&["document", "source"]),
        RoleDefinition::new("researcher")
            .with_name("Research Analyst")
            .with_description("Researches markets, competitors and trends")
            .with_domains(&["market_research"])
            .with_sub_domains(&["research", "market_analysis", "competitive_intelligence", "trend_analysis"])
            .with_output_types(&["research_reports", "market_insights", "analysis_reports", "trend_summaries"])
            .with_weak(&["doc_reader"])
            .with_keywords(&["research", "topic", "source"]),
        RoleDefinition::new("tester")
            .with_name("Test Engineer")
            .with_description("Designs and runs tests against an implementation")
            .with_domains(&["software_development"])
            .with_sub_domains(&["testing", "quality_assurance", "test_automation", "defect_analysis"])
            .with_output_types(&["test_cases", "test_reports", "defect_reports", "quality_metrics"])
            .with_strong(&["coder"])
            .with_weak(&["planner"])
            .with_keywords(&["code", "test", "requirement"]),
        RoleDefinition::new("reviewer")
            .with_name("Code Reviewer")
            .with_description("Reviews code quality, security and best practices")
            .with_domains(&["software_development"])
            .with_sub_domains(&["code_review", "code_quality", "security_analysis", "best_practices"])
            .with_output_types(&["review_comments", "quality_assessments", "security_reports", "improvement_suggestions"])
            .with_strong(&["coder", "tester"])
            .with_weak(&["planner"])
            .with_keywords(&["test", "coverage", "bug"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = RoleCatalog::builtin();
        assert_eq!(catalog.len(), 9);
        assert_eq!(catalog.ids()[0], "planner");
        let reviewer = catalog.get("reviewer").unwrap();
        assert_eq!(reviewer.strong_dependencies, vec!["coder", "tester"]);
        assert_eq!(reviewer.weak_dependencies, vec!["planner"]);
    }

    #[test]
    fn test_builtin_dependencies_resolve() {
        let catalog = RoleCatalog::builtin();
        for role in catalog.roles() {
            for dep in role.strong_dependencies.iter().chain(&role.weak_dependencies) {
                assert!(catalog.contains(dep), "{} -> {}", role.id, dep);
            }
        }
    }

    #[test]
    fn test_overrides_replace_and_append() {
        let catalog = RoleCatalog::builtin_with(vec![
            RoleDefinition::new("coder").with_strong(&[]),
            RoleDefinition::new("backup_coder").with_strong(&["planner"]),
        ]);
        assert_eq!(catalog.len(), 10);
        assert!(catalog.get("coder").unwrap().strong_dependencies.is_empty());
        // Override keeps original position
        assert_eq!(catalog.ids()[1], "coder");
        assert_eq!(catalog.ids()[9], "backup_coder");
    }

    #[test]
    fn test_role_definition_from_toml() {
        let role: RoleDefinition = toml::from_str(
            r#"
id = "translator"
strong_dependencies = ["tech_writer"]

[capability]
domains = ["content_creation"]
"#,
        )
        .unwrap();
        assert_eq!(role.id, "translator");
        assert!(role.name.is_empty());
        assert_eq!(role.capability.domains, vec!["content_creation"]);
        assert!(role.weak_dependencies.is_empty());
    }
}
