//! The `Stage` contract every pipeline component implements.

use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::error::ShieldResult;

/// A single step in the pipeline. Implementations mutate `ctx` in place and
/// may call `ctx.abort(reason)` to stop the pipeline early; the runner skips
/// any stage that finds `ctx.aborted` already true on entry.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable, human-readable name used in hook/event reporting and in
    /// runner stage-list operations (`add`/`remove`/`list`).
    fn name(&self) -> &str;

    /// Execute the stage. Returning `Err` causes the runner to abort the
    /// pipeline with `"<name>: <message>"` - this is reserved for genuine
    /// failures, not admission denials (those call `ctx.abort` directly and
    /// return `Ok`).
    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()>;
}
