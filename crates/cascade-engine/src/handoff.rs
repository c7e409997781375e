use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use cascade_core::catalog::RoleCatalog;
use cascade_core::config::HandoffConfig;
use cascade_core::types::{HandoffRecord, HandoffStatus, RoleResult, WorkflowId};

/// Fields every handoff must carry when no specific template exists.
pub const GENERIC_FIELDS: [&str; 3] = ["task_summary", "key_findings", "next_steps"];

/// Required fields for handoffs between two roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTemplate {
    pub name: String,
    pub required_fields: Vec<String>,
}

impl HandoffTemplate {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            required_fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn generic() -> Self {
        Self::new("generic", &GENERIC_FIELDS)
    }
}

/// Result of validating a handoff record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffValidation {
    /// presence × structuredness, in [0, 1].
    pub score: f64,
    pub passed: bool,
    pub missing_fields: Vec<String>,
    pub warnings: Vec<String>,
    pub template: String,
}

/// A freshly built handoff and its validation.
#[derive(Debug, Clone)]
pub struct HandoffOutcome {
    pub record: HandoffRecord,
    pub validation: HandoffValidation,
}

/// Packages completed role results into handoff records.
pub struct HandoffOrchestrator {
    templates: HashMap<(String, String), HandoffTemplate>,
    catalog: Option<Arc<RoleCatalog>>,
    min_quality_warning: f64,
    min_relevance_warning: f64,
}

impl HandoffOrchestrator {
    /// Orchestrator with the built-in templates.
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for (from, to, fields) in [
            ("coder", "tester", ["code_files", "test_requirements", "implementation_notes"]),
            ("planner", "coder", ["architecture_design", "technical_specs", "constraints"]),
            ("tester", "reviewer", ["test_results", "bug_reports", "test_coverage"]),
        ] {
            templates.insert(
                (from.to_string(), to.to_string()),
                HandoffTemplate::new(format!("{}_to_{}", from, to), &fields),
            );
        }
        Self {
            templates,
            catalog: None,
            min_quality_warning: 0.7,
            min_relevance_warning: 0.6,
        }
    }

    /// Built-in templates plus the ones from config (config wins).
    pub fn from_config(config: &HandoffConfig) -> Self {
        let mut orchestrator = Self::new();
        orchestrator.min_quality_warning = config.min_quality_warning;
        orchestrator.min_relevance_warning = config.min_relevance_warning;
        for t in &config.templates {
            let fields: Vec<&str> = t.required_fields.iter().map(|s| s.as_str()).collect();
            orchestrator = orchestrator.with_template(&t.from, &t.to, &fields);
        }
        orchestrator
    }

    pub fn with_template(mut self, from: &str, to: &str, fields: &[&str]) -> Self {
        self.templates.insert(
            (from.to_string(), to.to_string()),
            HandoffTemplate::new(format!("{}_to_{}", from, to), fields),
        );
        self
    }

    /// Use catalog keywords to check handoff relevance to the target role.
    pub fn with_catalog(mut self, catalog: Arc<RoleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn template_for(&self, from: &str, to: &str) -> HandoffTemplate {
        self.templates
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .unwrap_or_else(HandoffTemplate::generic)
    }

    /// Project `result` into a handoff record and validate it.
    pub fn create_handoff(
        &self,
        workflow_id: &WorkflowId,
        from: &str,
        to: &str,
        task_description: &str,
        result: &RoleResult,
    ) -> HandoffOutcome {
        let summary = result
            .handoff_summary
            .clone()
            .or_else(|| output_text(result, "task_summary"))
            .unwrap_or_default();
        let key_findings = if result.key_findings.is_empty() {
            output_list(result, "key_findings")
        } else {
            result.key_findings.clone()
        };
        let next_steps = if result.next_steps.is_empty() {
            output_list(result, "next_steps")
        } else {
            result.next_steps.clone()
        };

        let mut record = HandoffRecord {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.clone(),
            from_role: from.to_string(),
            to_role: to.to_string(),
            task_description: task_description.to_string(),
            summary,
            key_findings,
            deliverables: result.deliverables.clone(),
            next_steps,
            message: result.next_role_guidance.clone().unwrap_or_default(),
            payload: result.outputs.clone(),
            created_at: Utc::now(),
            status: HandoffStatus::Pending,
            validation_score: 0.0,
        };

        let template = self.template_for(from, to);
        let validation = self.validate(&record, &template);
        record.validation_score = validation.score;
        if !validation.passed {
            record.status = HandoffStatus::Rejected;
            warn!(
                workflow_id = %workflow_id,
                from,
                to,
                missing = ?validation.missing_fields,
                "Handoff failed validation"
            );
        } else {
            debug!(
                workflow_id = %workflow_id,
                from,
                to,
                score = validation.score,
                "Handoff created"
            );
        }

        HandoffOutcome { record, validation }
    }

    /// Score a record and check the template's required fields.
    pub fn validate(&self, record: &HandoffRecord, template: &HandoffTemplate) -> HandoffValidation {
        let missing_fields: Vec<String> = template
            .required_fields
            .iter()
            .filter(|f| !field_present(record, f))
            .cloned()
            .collect();

        let required = template.required_fields.len();
        let presence = if required == 0 {
            1.0
        } else {
            (required - missing_fields.len()) as f64 / required as f64
        };
        let quality = data_quality(record);
        let score = (presence * quality).clamp(0.0, 1.0);

        let mut warnings = Vec::new();
        if quality < self.min_quality_warning {
            warnings.push(format!("low data quality: {:.2}", quality));
        }
        if let Some(relevance) = self.relevance(record) {
            if relevance < self.min_relevance_warning {
                warnings.push(format!(
                    "low relevance to '{}': {:.2}",
                    record.to_role, relevance
                ));
            }
        }

        HandoffValidation {
            score,
            passed: missing_fields.is_empty(),
            missing_fields,
            warnings,
            template: template.name.clone(),
        }
    }

    /// Fraction of the target role's keywords mentioned in the record.
    fn relevance(&self, record: &HandoffRecord) -> Option<f64> {
        let catalog = self.catalog.as_ref()?;
        let role = catalog.get(&record.to_role)?;
        if role.keywords.is_empty() {
            return None;
        }
        let text = record_text(record).to_lowercase();
        let hits = role
            .keywords
            .iter()
            .filter(|k| text.contains(&k.to_lowercase()))
            .count();
        Some(hits as f64 / role.keywords.len() as f64)
    }
}

impl Default for HandoffOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn output_text(result: &RoleResult, key: &str) -> Option<String> {
    match result.outputs.get(key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn output_list(result: &RoleResult, key: &str) -> Vec<String> {
    match result.outputs.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(serde_json::Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => vec![],
    }
}

fn value_present(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

fn field_present(record: &HandoffRecord, field: &str) -> bool {
    if record.payload.get(field).is_some_and(value_present) {
        return true;
    }
    match field {
        "task_summary" | "summary" => !record.summary.trim().is_empty(),
        "key_findings" => !record.key_findings.is_empty(),
        "next_steps" => !record.next_steps.is_empty(),
        "deliverables" => !record.deliverables.is_empty(),
        _ => false,
    }
}

/// Mean of three checks: has content, has substance (> 100 chars), and the
/// share of payload values that are structured.
fn data_quality(record: &HandoffRecord) -> f64 {
    let has_content = !record.payload.is_empty()
        || !record.summary.is_empty()
        || !record.deliverables.is_empty()
        || !record.next_steps.is_empty();
    let non_empty = if has_content { 1.0 } else { 0.0 };

    let substantial = if record_text(record).chars().count() > 100 {
        1.0
    } else {
        0.0
    };

    let structured = if record.payload.is_empty() {
        // Typed fields are structured by construction
        if has_content { 1.0 } else { 0.0 }
    } else {
        let count = record
            .payload
            .values()
            .filter(|v| match v {
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => true,
                serde_json::Value::String(s) => s.chars().count() > 10,
                _ => false,
            })
            .count();
        count as f64 / record.payload.len() as f64
    };

    (non_empty + substantial + structured) / 3.0
}

fn record_text(record: &HandoffRecord) -> String {
    let mut parts: Vec<String> = vec![record.summary.clone(), record.message.clone()];
    parts.extend(record.key_findings.iter().cloned());
    parts.extend(record.deliverables.iter().cloned());
    parts.extend(record.next_steps.iter().cloned());
    for (k, v) in &record.payload {
        parts.push(k.clone());
        match v {
            serde_json::Value::String(s) => parts.push(s.clone()),
            other => parts.push(other.to_string()),
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf() -> WorkflowId {
        WorkflowId::from_str("wf-h")
    }

    fn coder_result() -> RoleResult {
        RoleResult::completed("coder")
            .with_output("code_files", json!(["src/lib.rs", "src/parser.rs"]))
            .with_output("test_requirements", json!({"unit": true, "fuzz": false}))
            .with_output(
                "implementation_notes",
                json!("Parser is streaming; quoted newlines handled in the lexer state machine."),
            )
            .with_deliverable("src/parser.rs")
            .with_summary("CSV parser implemented")
            .with_guidance("Focus tests on quoting edge cases")
    }

    #[test]
    fn test_specific_template_passes() {
        let o = HandoffOrchestrator::new();
        let outcome = o.create_handoff(&wf(), "coder", "tester", "Build a parser", &coder_result());
        assert!(outcome.validation.passed);
        assert_eq!(outcome.validation.template, "coder_to_tester");
        assert_eq!(outcome.record.status, HandoffStatus::Pending);
        assert_eq!(outcome.record.summary, "CSV parser implemented");
        assert_eq!(outcome.record.message, "Focus tests on quoting edge cases");
        assert_eq!(outcome.record.deliverables, vec!["src/parser.rs"]);
        // presence 1.0, all three quality checks pass
        assert!((outcome.validation.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_field_rejects() {
        let o = HandoffOrchestrator::new();
        let mut result = coder_result();
        result.outputs.remove("test_requirements");
        let outcome = o.create_handoff(&wf(), "coder", "tester", "Build a parser", &result);
        assert!(!outcome.validation.passed);
        assert_eq!(outcome.validation.missing_fields, vec!["test_requirements"]);
        assert_eq!(outcome.record.status, HandoffStatus::Rejected);
        assert!(outcome.validation.score < 1.0);
    }

    #[test]
    fn test_generic_template_uses_typed_fields() {
        let o = HandoffOrchestrator::new();
        let result = RoleResult::completed("researcher")
            .with_summary("Market is consolidating")
            .with_finding("three vendors hold 80% share")
            .with_next_step("draft the report");
        let outcome = o.create_handoff(&wf(), "researcher", "tech_writer", "Market study", &result);
        assert_eq!(outcome.validation.template, "generic");
        assert!(outcome.validation.passed);
    }

    #[test]
    fn test_generic_template_reads_outputs() {
        let o = HandoffOrchestrator::new();
        let result = RoleResult::completed("doc_reader")
            .with_output("task_summary", json!("Read the design doc"))
            .with_output("key_findings", json!(["a", "b"]))
            .with_output("next_steps", json!("summarize"));
        let outcome = o.create_handoff(&wf(), "doc_reader", "researcher", "t", &result);
        assert!(outcome.validation.passed);
        assert_eq!(outcome.record.summary, "Read the design doc");
        assert_eq!(outcome.record.key_findings, vec!["a", "b"]);
        assert_eq!(outcome.record.next_steps, vec!["summarize"]);
    }

    #[test]
    fn test_empty_result_fails_generic() {
        let o = HandoffOrchestrator::new();
        let outcome = o.create_handoff(&wf(), "a", "b", "t", &RoleResult::completed("a"));
        assert!(!outcome.validation.passed);
        assert_eq!(outcome.validation.missing_fields.len(), 3);
        assert_eq!(outcome.validation.score, 0.0);
    }

    #[test]
    fn test_config_template_overrides_builtin() {
        let config = HandoffConfig {
            templates: vec![cascade_core::config::HandoffTemplateConfig {
                from: "coder".into(),
                to: "tester".into(),
                required_fields: vec!["code_files".into()],
            }],
            ..HandoffConfig::default()
        };
        let o = HandoffOrchestrator::from_config(&config);
        let t = o.template_for("coder", "tester");
        assert_eq!(t.required_fields, vec!["code_files"]);
        assert_eq!(o.template_for("x", "y"), HandoffTemplate::generic());
    }

    #[test]
    fn test_relevance_warning() {
        let o = HandoffOrchestrator::new().with_catalog(Arc::new(RoleCatalog::builtin()));
        let result = RoleResult::completed("researcher")
            .with_summary("Weather was nice")
            .with_finding("sunny")
            .with_next_step("relax");
        // reviewer keywords: test, coverage, bug
        let outcome = o.create_handoff(&wf(), "researcher", "reviewer", "t", &result);
        assert!(outcome.validation.passed);
        assert!(outcome
            .validation
            .warnings
            .iter()
            .any(|w| w.contains("relevance")));
    }

    #[test]
    fn test_quality_checks() {
        let mut record = o_record();
        record.payload.insert("n".into(), json!(3));
        record.payload.insert("s".into(), json!("short"));
        // non-empty 1, short text 0, structured 0/2
        assert!((data_quality(&record) - 1.0 / 3.0).abs() < 1e-9);
    }

    fn o_record() -> HandoffRecord {
        HandoffOrchestrator::new()
            .create_handoff(&wf(), "a", "b", "", &RoleResult::completed("a"))
            .record
    }
}
