//! Context Trimmer - evicts the oldest non-pinned messages until the
//! conversation fits the model's input budget.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TrimmerConfig;
use crate::context::PipelineContext;
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::logging::log_debug;
use crate::pipeline::Stage;
use crate::tokens::TokenCounter;

/// Trims `ctx.messages` to fit `max_input_tokens - reserve_for_output -
/// tool_token_overhead`, preferring to drop the oldest non-pinned message
/// first. Writes the number of evicted tokens to `ctx.meta.context_saved`.
pub struct ContextTrimmer {
    config: TrimmerConfig,
    counter: Arc<dyn TokenCounter>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ContextTrimmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTrimmer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ContextTrimmer {
    pub fn new(config: TrimmerConfig, counter: Arc<dyn TokenCounter>, event_sink: Arc<dyn EventSink>) -> Self {
        Self { config, counter, event_sink }
    }

    fn budget(&self) -> u32 {
        self.config
            .max_input_tokens
            .saturating_sub(self.config.reserve_for_output)
            .saturating_sub(self.config.tool_token_overhead)
    }

    /// Trim `messages` in place against the configured budget, returning
    /// the number of tokens evicted. Leading pinned messages (system
    /// prompts, tool definitions) and the final user message are never
    /// dropped; eviction proceeds oldest-first among the remainder.
    pub fn trim(&self, messages: &mut Vec<crate::context::Message>) -> ShieldResult<u32> {
        let budget = self.budget();

        let mut token_counts: Vec<u32> =
            messages.iter().map(|m| self.counter.count_tokens(&m.content)).collect::<ShieldResult<_>>()?;

        let mut total: u32 = token_counts.iter().sum();
        if total <= budget {
            return Ok(0);
        }

        let mut evicted = 0u32;

        while total > budget {
            let last_user_idx = messages.iter().rposition(|m| m.role == crate::context::Role::User);
            let Some(victim) = messages.iter().position(|m| !m.is_pinned).filter(|&i| Some(i) != last_user_idx) else {
                break;
            };
            evicted += token_counts[victim];
            total -= token_counts[victim];
            messages.remove(victim);
            token_counts.remove(victim);
        }

        Ok(evicted)
    }
}

#[async_trait]
impl Stage for ContextTrimmer {
    fn name(&self) -> &str {
        "trimmer"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        let evicted = self.trim(&mut ctx.messages)?;
        if evicted > 0 {
            ctx.meta.context_saved += evicted;
            log_debug!(tokens_evicted = evicted, "context trimmed");
            self.event_sink.emit(PipelineEvent::ContextTrimmed { tokens_evicted: evicted });
        }
        Ok(())
    }
}
