use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CascadeError, Result};
use crate::types::WorkflowId;

/// The eight fixed sections of a role's working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    PrimaryIntent,
    KeyConcepts,
    FilesAndCode,
    ErrorsAndFixes,
    ProblemSolving,
    UserMessages,
    PendingTasks,
    CurrentWork,
}

impl Section {
    pub const ALL: [Section; 8] = [
        Section::PrimaryIntent,
        Section::KeyConcepts,
        Section::FilesAndCode,
        Section::ErrorsAndFixes,
        Section::ProblemSolving,
        Section::UserMessages,
        Section::PendingTasks,
        Section::CurrentWork,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Section::PrimaryIntent => "Primary Request and Intent",
            Section::KeyConcepts => "Key Technical Concepts",
            Section::FilesAndCode => "Files and Code Sections",
            Section::ErrorsAndFixes => "Errors and Fixes",
            Section::ProblemSolving => "Problem Solving",
            Section::UserMessages => "All User Messages",
            Section::PendingTasks => "Pending Tasks",
            Section::CurrentWork => "Current Work",
        }
    }
}

/// One labeled block of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    pub content: String,
    /// Assigned by the writer, in [0, 1].
    pub importance: f64,
    pub last_updated: DateTime<Utc>,
}

impl ContextSection {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            content: String::new(),
            importance: 0.0,
            last_updated: now,
        }
    }
}

/// Isolated working memory for one role within one workflow.
///
/// The section set is fixed at creation. Compression can only remove
/// sections; once compressed the context is read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolatedRoleContext {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub role_id: String,
    sections: BTreeMap<Section, ContextSection>,
    /// Handoff this context was seeded from, if any.
    #[serde(default)]
    pub handoff_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub original_size: usize,
    #[serde(default)]
    pub compressed_size: usize,
    #[serde(default)]
    pub compression_ratio: Option<f64>,
}

impl IsolatedRoleContext {
    /// Allocate a context with all eight sections empty at importance 0.
    pub fn new(workflow_id: WorkflowId, role_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let sections = Section::ALL
            .iter()
            .map(|s| (*s, ContextSection::empty(now)))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id,
            role_id: role_id.into(),
            sections,
            handoff_id: None,
            created_at: now,
            compressed: false,
            original_size: 0,
            compressed_size: 0,
            compression_ratio: None,
        }
    }

    /// Overwrite a section. Importance is clamped to [0, 1].
    pub fn write(
        &mut self,
        section: Section,
        content: impl Into<String>,
        importance: f64,
    ) -> Result<()> {
        if self.compressed {
            return Err(CascadeError::ContextSealed(self.id.clone()));
        }
        let entry = self
            .sections
            .entry(section)
            .or_insert_with(|| ContextSection::empty(Utc::now()));
        entry.content = content.into();
        entry.importance = importance.clamp(0.0, 1.0);
        entry.last_updated = Utc::now();
        Ok(())
    }

    /// Append a line to a section, keeping the higher of the two importances.
    pub fn append(&mut self, section: Section, line: &str, importance: f64) -> Result<()> {
        let (content, current) = match self.sections.get(&section) {
            Some(s) if !s.content.is_empty() => {
                (format!("{}\n{}", s.content, line), s.importance)
            }
            Some(s) => (line.to_string(), s.importance),
            None => (line.to_string(), 0.0),
        };
        self.write(section, content, current.max(importance))
    }

    pub fn section(&self, section: Section) -> Option<&ContextSection> {
        self.sections.get(&section)
    }

    pub fn sections(&self) -> &BTreeMap<Section, ContextSection> {
        &self.sections
    }

    /// Total content length in characters.
    pub fn size(&self) -> usize {
        self.sections.values().map(|s| s.content.chars().count()).sum()
    }

    /// Drop every section whose importance is below `threshold` and seal
    /// the context. Returns the number of sections removed. A compressed
    /// context is left untouched.
    pub fn prune_below(&mut self, threshold: f64) -> usize {
        if self.compressed {
            return 0;
        }
        let original = self.size();
        let before = self.sections.len();
        self.sections.retain(|_, s| s.importance >= threshold);
        let compressed = self.size();

        self.original_size = original;
        self.compressed_size = compressed;
        self.compression_ratio = Some(if original == 0 {
            1.0
        } else {
            compressed as f64 / original as f64
        });
        self.compressed = true;
        before - self.sections.len()
    }

    /// Render non-empty sections as markdown, most important first.
    pub fn render(&self) -> String {
        let mut ordered: Vec<(&Section, &ContextSection)> = self
            .sections
            .iter()
            .filter(|(_, s)| !s.content.trim().is_empty())
            .collect();
        // Stable sort keeps section order for equal importance
        ordered.sort_by(|a, b| {
            b.1.importance
                .partial_cmp(&a.1.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut out = String::new();
        for (section, body) in ordered {
            out.push_str("## ");
            out.push_str(section.label());
            out.push('\n');
            out.push_str(body.content.trim_end());
            out.push_str("\n\n");
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> IsolatedRoleContext {
        IsolatedRoleContext::new(WorkflowId::from_str("wf-1"), "coder")
    }

    #[test]
    fn test_new_has_all_sections() {
        let c = ctx();
        assert_eq!(c.sections().len(), 8);
        for s in Section::ALL {
            let sec = c.section(s).unwrap();
            assert!(sec.content.is_empty());
            assert_eq!(sec.importance, 0.0);
        }
    }

    #[test]
    fn test_write_clamps_importance() {
        let mut c = ctx();
        c.write(Section::PrimaryIntent, "build a parser", 1.7).unwrap();
        assert_eq!(c.section(Section::PrimaryIntent).unwrap().importance, 1.0);
        c.write(Section::CurrentWork, "x", -0.5).unwrap();
        assert_eq!(c.section(Section::CurrentWork).unwrap().importance, 0.0);
    }

    #[test]
    fn test_append_keeps_higher_importance() {
        let mut c = ctx();
        c.write(Section::ErrorsAndFixes, "first", 0.6).unwrap();
        c.append(Section::ErrorsAndFixes, "second", 0.4).unwrap();
        let sec = c.section(Section::ErrorsAndFixes).unwrap();
        assert_eq!(sec.content, "first\nsecond");
        assert_eq!(sec.importance, 0.6);
    }

    #[test]
    fn test_prune_seals_context() {
        let mut c = ctx();
        c.write(Section::PrimaryIntent, "intent", 0.9).unwrap();
        let removed = c.prune_below(0.3);
        assert_eq!(removed, 7);
        assert!(c.compressed);
        assert!(matches!(
            c.write(Section::CurrentWork, "late", 0.9),
            Err(CascadeError::ContextSealed(_))
        ));
    }

    #[test]
    fn test_ratio_of_empty_context_is_one() {
        let mut c = ctx();
        c.prune_below(0.3);
        assert_eq!(c.compression_ratio, Some(1.0));
    }

    #[test]
    fn test_render_orders_by_importance() {
        let mut c = ctx();
        c.write(Section::PendingTasks, "write tests", 0.8).unwrap();
        c.write(Section::PrimaryIntent, "build a parser", 0.9).unwrap();
        c.write(Section::ProblemSolving, "", 0.7).unwrap();
        let text = c.render();
        let intent = text.find("## Primary Request and Intent").unwrap();
        let pending = text.find("## Pending Tasks").unwrap();
        assert!(intent < pending);
        assert!(!text.contains("Problem Solving"));
    }

    #[test]
    fn test_serde_round_trip_preserves_sections() {
        let mut c = ctx();
        c.write(Section::KeyConcepts, "tokenizer", 0.7).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: IsolatedRoleContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
