//! Prefix Optimizer - reorders messages into a stable, cacheable prefix
//! and a volatile suffix, and estimates provider prompt-cache savings.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PrefixConfig;
use crate::context::{Message, PipelineContext};
use crate::error::ShieldResult;
use crate::pricing::ModelPricingTable;
use crate::pipeline::Stage;
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixAnalysis {
    pub prefix_tokens: u32,
    pub volatile_tokens: u32,
    pub estimated_prefix_savings: f64,
    pub prefix_eligible_for_caching: bool,
    pub context_window_exceeded: bool,
    pub overflow_tokens: u32,
}

/// Splits messages into a stable prefix (system + tool-definition
/// messages) and a volatile suffix (everything else), preserving relative
/// order within each group.
pub struct PrefixOptimizer {
    config: PrefixConfig,
    counter: Arc<dyn TokenCounter>,
    pricing: Arc<ModelPricingTable>,
    reserve_for_output: u32,
}

impl std::fmt::Debug for PrefixOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixOptimizer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl PrefixOptimizer {
    pub fn new(config: PrefixConfig, counter: Arc<dyn TokenCounter>, pricing: Arc<ModelPricingTable>, reserve_for_output: u32) -> Self {
        Self { config, counter, pricing, reserve_for_output }
    }

    fn is_stable(message: &Message) -> bool {
        message.role == crate::context::Role::System || message.is_tool_definition
    }

    /// Reorder `messages` into `prefix ++ suffix` and compute the savings
    /// analysis. Does not mutate `messages` unless the caller applies the
    /// returned reordering.
    pub fn analyze(&self, messages: &[Message], model: &str) -> ShieldResult<(Vec<Message>, PrefixAnalysis)> {
        let (prefix, suffix): (Vec<Message>, Vec<Message>) = messages.iter().cloned().partition(Self::is_stable);

        let prefix_tokens: u32 =
            prefix.iter().map(|m| self.counter.count_tokens(&m.content)).collect::<ShieldResult<Vec<_>>>()?.into_iter().sum();
        let volatile_tokens: u32 =
            suffix.iter().map(|m| self.counter.count_tokens(&m.content)).collect::<ShieldResult<Vec<_>>>()?.into_iter().sum();

        let eligible = match self.config.provider {
            crate::config::PromptCacheProvider::Anthropic => prefix_tokens >= self.config.anthropic_min_prefix_tokens,
            crate::config::PromptCacheProvider::Unknown => false,
            _ => prefix_tokens > 0,
        };

        let discount = self.config.discount_factor();
        let pricing_entry = self.pricing.get(model);
        let estimated_prefix_savings = if eligible {
            (prefix_tokens as f64 / 1_000_000.0) * pricing_entry.input_per_million * discount
        } else {
            0.0
        };

        let context_window = pricing_entry.context_window.unwrap_or(u32::MAX);
        let total = prefix_tokens as u64 + volatile_tokens as u64 + self.reserve_for_output as u64;
        let context_window_exceeded = total > context_window as u64;
        let overflow_tokens = total.saturating_sub(context_window as u64) as u32;

        let reordered: Vec<Message> = prefix.into_iter().chain(suffix).collect();

        Ok((
            reordered,
            PrefixAnalysis {
                prefix_tokens,
                volatile_tokens,
                estimated_prefix_savings,
                prefix_eligible_for_caching: eligible,
                context_window_exceeded,
                overflow_tokens,
            },
        ))
    }
}

#[async_trait]
impl Stage for PrefixOptimizer {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        if ctx.aborted || !self.pricing.contains(&ctx.model_id) {
            return Ok(());
        }

        let (reordered, analysis) = self.analyze(&ctx.messages, &ctx.model_id)?;
        if analysis.estimated_prefix_savings > 0.0 {
            ctx.messages = reordered;
            ctx.meta.prefix_saved = analysis.estimated_prefix_savings;
        }

        Ok(())
    }
}
