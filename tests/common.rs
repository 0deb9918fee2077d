//! Shared fixtures for the end-to-end pipeline tests.
//!
//! IMPORTANT: these helpers are test-only and should never be used in
//! production code.

#![allow(dead_code)]

use std::sync::Arc;

use cost_shield::config::{
    BreakerConfig, BreakerLimits, CacheConfig, GuardConfig, PipelineConfig, PrefixConfig,
    RouterConfig, TrimmerConfig, UserBudgetConfig,
};
use cost_shield::events::{NullEventSink, RecordingEventSink};
use cost_shield::pricing::{ModelPricingTable, PricingEntry};
use cost_shield::storage::NullStorageAdapter;
use cost_shield::{
    CircuitBreaker, ContextTrimmer, CostLedger, Message, ModelRouter, Pipeline, PipelineContext,
    PrefixOptimizer, RequestGuard, ResponseCache, TokenCounterFactory, UserBudgetManager,
};

/// A pricing table with one real entry (used in most scenarios) so cost math
/// stays predictable, plus the crate's always-on fallback for unknown models.
pub fn test_pricing() -> Arc<ModelPricingTable> {
    let mut table = ModelPricingTable::with_common_models();
    table.insert(
        "gpt-4o-mini",
        PricingEntry::new(0.15, 0.60).with_cached_input(0.075).with_context_window(128_000),
    );
    Arc::new(table)
}

pub fn null_sink() -> Arc<NullEventSink> {
    Arc::new(NullEventSink)
}

pub fn recording_sink() -> Arc<RecordingEventSink> {
    Arc::new(RecordingEventSink::new())
}

pub fn null_storage() -> Arc<NullStorageAdapter> {
    Arc::new(NullStorageAdapter)
}

pub fn approximate_counter() -> Arc<dyn cost_shield::TokenCounter> {
    TokenCounterFactory::create_counter("gpt-4o-mini").expect("token counter")
}

/// Builds a full eight-stage pipeline (minus the ledger, which is invoked by
/// the caller after the simulated provider response, not as a mid-pipeline
/// stage) wired with the given configs and a shared event sink.
pub fn build_pipeline(
    config: PipelineConfig,
    pricing: Arc<ModelPricingTable>,
    event_sink: Arc<dyn cost_shield::EventSink>,
) -> Pipeline {
    let storage = null_storage();
    let counter = approximate_counter();

    let breaker = CircuitBreaker::new(config.breaker, pricing.clone(), counter.clone(), storage.clone(), event_sink.clone());
    let user_budget = UserBudgetManager::new(config.user_budget, pricing.clone(), counter.clone(), event_sink.clone());
    let guard = RequestGuard::with_event_sink(config.guard, pricing.clone(), counter.clone(), event_sink.clone());
    let cache = ResponseCache::new(config.cache, storage.clone(), event_sink.clone());
    let trimmer = ContextTrimmer::new(config.trimmer, counter.clone(), event_sink.clone());
    let router = ModelRouter::new(config.router, event_sink.clone());
    let prefix = PrefixOptimizer::new(config.prefix, counter, pricing, config.trimmer.reserve_for_output);

    let mut pipeline = Pipeline::new();
    pipeline
        .add_stage(Arc::new(breaker))
        .add_stage(Arc::new(user_budget))
        .add_stage(Arc::new(guard))
        .add_stage(Arc::new(cache))
        .add_stage(Arc::new(trimmer))
        .add_stage(Arc::new(router))
        .add_stage(Arc::new(prefix));
    pipeline
}

pub fn build_ledger(pricing: Arc<ModelPricingTable>) -> CostLedger {
    CostLedger::new(
        10_000,
        false,
        pricing,
        null_storage(),
        Arc::new(cost_shield::NullBroadcastChannel),
        null_sink(),
    )
}

pub fn default_config() -> PipelineConfig {
    PipelineConfig {
        breaker: BreakerConfig::default(),
        user_budget: UserBudgetConfig::with_defaults(),
        guard: GuardConfig::default(),
        cache: CacheConfig::default(),
        trimmer: TrimmerConfig::default(),
        router: RouterConfig::default(),
        prefix: PrefixConfig::default(),
        ledger: Default::default(),
    }
}

pub fn user_prompt(text: &str) -> Vec<Message> {
    vec![Message::system("You are a helpful assistant."), Message::user(text)]
}

pub const fn zero_session_limit() -> BreakerLimits {
    BreakerLimits { per_session: Some(0.0), per_hour: None, per_day: None, per_month: None }
}
