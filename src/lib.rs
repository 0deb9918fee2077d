//! # cost-shield
//!
//! A cost-control middleware pipeline for LLM requests: per-window spend
//! caps, per-user budgets, request-level admission control, a
//! normalization-and-similarity response cache, context trimming, a
//! complexity-based model router, a prompt-cache prefix optimizer, and a
//! cost ledger that closes the accounting loop after the provider call.
//!
//! ## Key Features
//!
//! - **Circuit Breaker**: rolling-window absolute spend caps (session/hour/day/month)
//! - **User Budgets**: per-user rolling caps with atomic in-flight reservation
//! - **Request Guard**: dedup, debounce, rate limiting, hourly cost gating
//! - **Response Cache**: exact + fuzzy lookup with content-type-aware TTL
//! - **Context Trimmer**: token-budget-aware message eviction
//! - **Model Router**: deterministic complexity scoring with tier downgrade
//! - **Prefix Optimizer**: provider prompt-cache savings estimation
//! - **Cost Ledger**: per-call accounting with CSV/JSON export
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cost_shield::{Pipeline, PipelineContext, Message};
//! use cost_shield::stages::{CircuitBreaker, RequestGuard};
//! use cost_shield::config::{BreakerConfig, GuardConfig};
//! use cost_shield::pricing::ModelPricingTable;
//! use cost_shield::storage::NullStorageAdapter;
//! use cost_shield::events::NullEventSink;
//! use cost_shield::TokenCounterFactory;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pricing = Arc::new(ModelPricingTable::with_common_models());
//! let counter = TokenCounterFactory::create_counter("gpt-4o-mini")?;
//! let breaker = CircuitBreaker::new(
//!     BreakerConfig::default(),
//!     pricing.clone(),
//!     counter.clone(),
//!     Arc::new(NullStorageAdapter),
//!     Arc::new(NullEventSink),
//! );
//! let guard = RequestGuard::new(GuardConfig::default(), pricing.clone(), counter.clone());
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add_stage(Arc::new(breaker));
//! pipeline.add_stage(Arc::new(guard));
//!
//! let mut ctx = PipelineContext::new(vec![Message::user("hello")], "gpt-4o-mini");
//! pipeline.run(&mut ctx).await;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_errors_doc)]

pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub(crate) mod logging;
pub mod normalize;
pub mod pipeline;
pub mod pricing;
pub mod stages;
pub mod storage;
pub mod tokens;

// Pipeline runner
pub use pipeline::{Pipeline, Stage};

// Context
pub use context::{CacheHitInfo, Message, Meta, PipelineContext, Role};

// Errors
pub use error::{ShieldError, ShieldResult};

// Configuration
pub use config::{
    BreakerAction, BreakerConfig, BreakerLimits, CacheConfig, ContentType, GuardConfig,
    LedgerConfig, PipelineConfig, PrefixConfig, PromptCacheProvider, RouterConfig, RouterTier,
    TrimmerConfig, UserBudgetConfig, UserBudgetLimits,
};

// Events and callback surface
pub use events::{EventSink, Hooks, NullEventSink, PipelineEvent, RecordingEventSink};

// Pricing and token counting
pub use pricing::{cost, ModelPricingTable, PricingEntry};
pub use tokens::{ApproximateTokenCounter, OpenAITokenCounter, TokenCounter, TokenCounterFactory};

// Persistence and cross-process sync
pub use broadcast::{BroadcastChannel, BroadcastMessage, NullBroadcastChannel, TokioBroadcastChannel};
pub use storage::{InMemoryStorageAdapter, NullStorageAdapter, StorageAdapter};

// Stage implementations
pub use stages::{
    CircuitBreaker, ContextTrimmer, CostLedger, ModelRouter, PrefixOptimizer, RequestGuard,
    ResponseCache, UserBudgetManager,
};
