use futures::future::BoxFuture;

use crate::context::IsolatedRoleContext;
use crate::error::Result;
use crate::types::RoleResult;

/// Runs one role against its isolated context.
///
/// Returning `Err` or a result with failed status both count as a role
/// failure and go through error recovery.
pub trait RoleExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        role: String,
        context: IsolatedRoleContext,
    ) -> BoxFuture<'_, Result<RoleResult>>;
}

/// Single-shot completion used for error classification.
pub trait LlmClient: Send + Sync + 'static {
    /// Provider/model label for logs.
    fn name(&self) -> &str {
        "llm"
    }

    /// Send a prompt and return the full response text.
    fn complete(&self, prompt: String) -> BoxFuture<'_, Result<String>>;
}
