//! Configuration for every pipeline stage.
//!
//! Each stage owns a small config struct with a `Default` impl carrying the
//! numeric defaults called out in the component design. There is no schema
//! validation layer here (out of scope) - these are plain data, validated
//! only where the domain genuinely requires it (e.g. an `Option<f64>` limit
//! of `Some(0.0)` means "block everything", distinct from `None` meaning
//! "unlimited" - that distinction is encoded in the type, not checked at
//! runtime).

use std::time::Duration;

/// Action taken when a circuit breaker limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAction {
    /// Deny the request.
    Stop,
    /// Allow the request but mark it as throttled.
    Throttle,
    /// Allow the request with no indication to the caller.
    Warn,
}

/// Per-window absolute spend caps for the circuit breaker.
///
/// `Some(0.0)` means "block everything in this window"; `None` means
/// "no limit for this window". This distinction is load-bearing.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerLimits {
    pub per_session: Option<f64>,
    pub per_hour: Option<f64>,
    pub per_day: Option<f64>,
    pub per_month: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub limits: BreakerLimits,
    pub action: BreakerAction,
    /// Fraction of a limit at which a warning fires, before it trips.
    pub warning_threshold: f64,
    pub persist: bool,
    pub max_records: usize,
    pub retention: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            limits: BreakerLimits::default(),
            action: BreakerAction::Stop,
            warning_threshold: 0.8,
            persist: false,
            max_records: 50_000,
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Per-user rolling spend caps, resolved user-specific -> default -> unlimited.
#[derive(Debug, Clone, Default)]
pub struct UserBudgetLimits {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
    /// Tier name used to look up `UserBudgetConfig::tier_models` for
    /// budget-enforced model routing.
    pub tier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UserBudgetConfig {
    pub default_limits: UserBudgetLimits,
    /// Per-user overrides, keyed by opaque user ID.
    pub user_limits: std::collections::HashMap<String, UserBudgetLimits>,
    /// Model a user's tier should be routed to, keyed by tier name.
    pub tier_models: std::collections::HashMap<String, String>,
    pub max_inflight_users: usize,
    pub max_warning_entries: usize,
}

/// Matches `with_defaults()` - a bare `#[derive(Default)]` would silently
/// zero `max_inflight_users`/`max_warning_entries`, which turns every
/// reservation into an immediate eviction of itself.
impl Default for UserBudgetConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl UserBudgetConfig {
    pub fn limits_for(&self, user_id: &str) -> UserBudgetLimits {
        self.user_limits
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }

    /// Defaults matching the documented hard caps (5,000 in-flight users,
    /// 500 warning entries).
    pub fn with_defaults() -> Self {
        Self {
            default_limits: UserBudgetLimits::default(),
            user_limits: Default::default(),
            tier_models: Default::default(),
            max_inflight_users: 5_000,
            max_warning_entries: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub min_input_length: usize,
    pub max_input_tokens: Option<u32>,
    pub dedup_window: Duration,
    pub debounce: Duration,
    pub max_requests_per_minute: u32,
    pub max_cost_per_hour: Option<f64>,
    pub dedup_inflight: bool,
    pub max_recent_prompts: usize,
    pub max_rate_limit_timestamps: usize,
    pub max_cost_log_entries: usize,
    pub max_inflight_entries: usize,
    pub inflight_max_age: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_input_length: 2,
            max_input_tokens: None,
            dedup_window: Duration::from_secs(60),
            debounce: Duration::from_millis(0),
            max_requests_per_minute: 60,
            max_cost_per_hour: None,
            dedup_inflight: true,
            max_recent_prompts: 1_000,
            max_rate_limit_timestamps: 200,
            max_cost_log_entries: 500,
            max_inflight_entries: 50,
            inflight_max_age: Duration::from_secs(300),
        }
    }
}

/// Content-type classification used to pick a cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Factual,
    General,
    TimeSensitive,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub similarity_threshold: f64,
    pub ttl_factual: Duration,
    pub ttl_general: Duration,
    pub ttl_time_sensitive: Duration,
    pub use_semantic_index: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            similarity_threshold: 0.85,
            ttl_factual: Duration::from_secs(7 * 24 * 3600),
            ttl_general: Duration::from_secs(24 * 3600),
            ttl_time_sensitive: Duration::from_secs(5 * 60),
            use_semantic_index: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrimmerConfig {
    pub max_input_tokens: u32,
    pub reserve_for_output: u32,
    pub tool_token_overhead: u32,
}

impl Default for TrimmerConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 128_000,
            reserve_for_output: 1_000,
            tool_token_overhead: 0,
        }
    }
}

/// A complexity-score ceiling mapped to a model, sorted ascending by
/// `max_complexity` when consumed by the router.
#[derive(Debug, Clone)]
pub struct RouterTier {
    pub model_id: String,
    pub max_complexity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub tiers: Vec<RouterTier>,
    /// Fraction (0..1) of requests held back from routing, for A/B testing.
    pub ab_holdback_fraction: f64,
}

/// Supported provider families for prompt-cache discount estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptCacheProvider {
    OpenAI,
    Google,
    Anthropic,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct PrefixConfig {
    pub provider: PromptCacheProvider,
    /// Anthropic requires at least this many prefix tokens to be eligible.
    pub anthropic_min_prefix_tokens: u32,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            provider: PromptCacheProvider::Unknown,
            anthropic_min_prefix_tokens: 1024,
        }
    }
}

impl PrefixConfig {
    /// Discount factor applied to cacheable prefix tokens for this provider.
    pub fn discount_factor(&self) -> f64 {
        match self.provider {
            PromptCacheProvider::OpenAI => 0.50,
            PromptCacheProvider::Google => 0.75,
            PromptCacheProvider::Anthropic => 0.90,
            PromptCacheProvider::Unknown => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    pub max_entries: usize,
    pub persist: bool,
    pub broadcast: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            persist: false,
            broadcast: false,
        }
    }
}

/// Aggregate configuration for every stage, assembled programmatically by
/// the caller the way the source assembles provider configs - there is no
/// on-disk schema to parse.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub breaker: BreakerConfig,
    pub user_budget: UserBudgetConfig,
    pub guard: GuardConfig,
    pub cache: CacheConfig,
    pub trimmer: TrimmerConfig,
    pub router: RouterConfig,
    pub prefix: PrefixConfig,
    pub ledger: LedgerConfig,
}
