use serde::{Deserialize, Serialize};
use tracing::debug;

use cascade_core::context::{IsolatedRoleContext, Section};
use cascade_core::error::Result;
use cascade_core::types::{HandoffRecord, WorkflowId};

/// Importance assigned to task intent carried over from a handoff.
pub const INTENT_WEIGHT: f64 = 0.9;
/// Importance for deliverables and next steps.
pub const PRIMARY_WEIGHT: f64 = 0.8;
/// Importance for auxiliary notes: findings, messages, provenance.
pub const AUXILIARY_WEIGHT: f64 = 0.7;

/// Outcome of compressing a context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub removed_sections: usize,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    /// False when the context had already been compressed.
    pub applied: bool,
}

/// Aggregate numbers over a set of contexts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStats {
    pub total: usize,
    pub compressed: usize,
    pub average_ratio: Option<f64>,
    pub total_size: usize,
}

/// Builds isolated per-role contexts and compresses them before handoff.
#[derive(Debug, Clone)]
pub struct ContextEngine {
    retention_threshold: f64,
}

impl ContextEngine {
    pub fn new(retention_threshold: f64) -> Self {
        Self {
            retention_threshold: retention_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn retention_threshold(&self) -> f64 {
        self.retention_threshold
    }

    /// Allocate the eight sections for `role`, seeded from `handoff` if given.
    pub fn create_isolated(
        &self,
        workflow_id: &WorkflowId,
        role: &str,
        handoff: Option<&HandoffRecord>,
    ) -> Result<IsolatedRoleContext> {
        let mut ctx = IsolatedRoleContext::new(workflow_id.clone(), role);

        if let Some(h) = handoff {
            ctx.handoff_id = Some(h.id.clone());

            if !h.task_description.is_empty() {
                ctx.write(Section::PrimaryIntent, h.task_description.clone(), INTENT_WEIGHT)?;
            }
            if !h.deliverables.is_empty() {
                ctx.write(Section::FilesAndCode, bullet_list(&h.deliverables), PRIMARY_WEIGHT)?;
            }
            if !h.next_steps.is_empty() {
                ctx.write(Section::PendingTasks, bullet_list(&h.next_steps), PRIMARY_WEIGHT)?;
            }

            let mut concepts = Vec::new();
            if !h.summary.is_empty() {
                concepts.push(h.summary.clone());
            }
            concepts.extend(h.key_findings.iter().map(|f| format!("- {}", f)));
            if !concepts.is_empty() {
                ctx.write(Section::KeyConcepts, concepts.join("\n"), AUXILIARY_WEIGHT)?;
            }

            if !h.message.is_empty() {
                ctx.write(Section::ProblemSolving, h.message.clone(), AUXILIARY_WEIGHT)?;
            }
            ctx.write(
                Section::CurrentWork,
                format!("Continuing from '{}' (handoff {})", h.from_role, h.id),
                AUXILIARY_WEIGHT,
            )?;
        }

        debug!(
            workflow_id = %workflow_id,
            role,
            seeded = handoff.is_some(),
            "Created isolated context"
        );
        Ok(ctx)
    }

    /// Drop sections below the retention threshold and seal the context.
    /// Compressing twice changes nothing.
    pub fn compress(&self, ctx: &mut IsolatedRoleContext) -> CompressionReport {
        if ctx.compressed {
            return CompressionReport {
                removed_sections: 0,
                original_size: ctx.original_size,
                compressed_size: ctx.compressed_size,
                compression_ratio: ctx.compression_ratio.unwrap_or(1.0),
                applied: false,
            };
        }

        let removed_sections = ctx.prune_below(self.retention_threshold);
        let report = CompressionReport {
            removed_sections,
            original_size: ctx.original_size,
            compressed_size: ctx.compressed_size,
            compression_ratio: ctx.compression_ratio.unwrap_or(1.0),
            applied: true,
        };
        debug!(
            context_id = %ctx.id,
            role = %ctx.role_id,
            removed = removed_sections,
            ratio = report.compression_ratio,
            "Compressed context"
        );
        report
    }

    pub fn stats<'a>(&self, contexts: impl IntoIterator<Item = &'a IsolatedRoleContext>) -> ContextStats {
        let mut stats = ContextStats::default();
        let mut ratio_sum = 0.0;
        for ctx in contexts {
            stats.total += 1;
            stats.total_size += ctx.size();
            if let (true, Some(ratio)) = (ctx.compressed, ctx.compression_ratio) {
                stats.compressed += 1;
                ratio_sum += ratio;
            }
        }
        if stats.compressed > 0 {
            stats.average_ratio = Some(ratio_sum / stats.compressed as f64);
        }
        stats
    }
}

impl Default for ContextEngine {
    fn default() -> Self {
        Self::new(0.3)
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}
