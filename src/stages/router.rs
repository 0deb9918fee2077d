//! Model Router - deterministic complexity scoring with tier-based
//! downgrade and optional A/B holdback.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::RouterConfig;
use crate::context::PipelineContext;
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::logging::log_debug;
use crate::pipeline::Stage;

/// Complexity tier, derived from `score` by simple thresholds: a cheap,
/// human-readable label alongside the numeric score every tier boundary
/// actually routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone)]
pub struct ComplexityAnalysis {
    pub score: f64,
    pub tier: ComplexityTier,
    pub recommended_tier: ComplexityTier,
}

static CODE_SIGNAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"```|\bfn \w+\(|\bdef \w+\(|class \w+|\{\s*\n").unwrap());
static JSON_SIGNAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[{\[]\s*"[\w-]+"\s*:"#).unwrap());
static ANALYTICAL_VERBS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(analyze|compare|evaluate|explain why|design|optimi[sz]e|derive|prove|refactor)\b").unwrap());
static MULTI_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(first|second|then|finally|additionally|also,)\b").unwrap());

/// Score surface features of `text` deterministically into `0..=100`.
/// Weights are tuned but the mapping itself is pure - same input, same
/// score, forever.
pub fn analyze_complexity(text: &str) -> ComplexityAnalysis {
    let lower = text.to_lowercase();
    let mut score = 0.0f64;

    let length = text.chars().count();
    score += (length as f64 / 50.0).min(25.0);

    let question_marks = text.matches('?').count();
    if question_marks > 1 {
        score += 10.0;
    }

    if CODE_SIGNAL.is_match(text) {
        score += 25.0;
    }
    if JSON_SIGNAL.is_match(text) {
        score += 15.0;
    }
    if ANALYTICAL_VERBS.is_match(&lower) {
        score += 20.0;
    }
    if MULTI_PART.is_match(&lower) {
        score += 15.0;
    }

    let score = score.min(100.0);

    let tier = if score < 25.0 {
        ComplexityTier::Simple
    } else if score < 60.0 {
        ComplexityTier::Moderate
    } else {
        ComplexityTier::Complex
    };

    ComplexityAnalysis { score, tier, recommended_tier: tier }
}

/// Routes `ctx.model_id` down to the cheapest tier model whose
/// `max_complexity` still covers the analyzed score, unless an earlier
/// stage already performed tier-based routing.
pub struct ModelRouter {
    config: RouterConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ModelRouter {
    pub fn new(config: RouterConfig, event_sink: Arc<dyn EventSink>) -> Self {
        Self { config, event_sink }
    }

    fn pick_tier(&self, score: f64) -> Option<&str> {
        let mut sorted: Vec<&crate::config::RouterTier> = self.config.tiers.iter().collect();
        sorted.sort_by(|a, b| a.max_complexity.partial_cmp(&b.max_complexity).unwrap());
        sorted
            .into_iter()
            .find(|tier| tier.max_complexity >= score)
            .map(|tier| tier.model_id.as_str())
    }
}

#[async_trait]
impl Stage for ModelRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        if ctx.aborted || self.config.tiers.is_empty() || ctx.meta.tier_routed || ctx.last_user_text.is_empty() {
            return Ok(());
        }

        if self.config.ab_holdback_fraction > 0.0 && fastrand::f64() < self.config.ab_holdback_fraction {
            ctx.meta.ab_test_holdout = true;
            log_debug!("router A/B holdback, skipping routing for this request");
            self.event_sink.emit(PipelineEvent::RouterHoldback);
            return Ok(());
        }

        let analysis = analyze_complexity(&ctx.last_user_text);
        ctx.meta.complexity = Some(analysis.score);

        if let Some(target) = self.pick_tier(analysis.score) {
            if target != ctx.model_id {
                if ctx.meta.original_model.is_none() {
                    ctx.meta.original_model = Some(ctx.model_id.clone());
                }
                let from = ctx.model_id.clone();
                ctx.model_id = target.to_string();
                self.event_sink.emit(PipelineEvent::RouterDowngraded { from_model: from, to_model: target.to_string() });
            }
        }

        Ok(())
    }
}
