//! Request Guard - per-request admission: debounce, rate limit, hourly
//! cost, in-flight dedup, and time-window dedup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::GuardConfig;
use crate::context::PipelineContext;
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::normalize::normalize;
use crate::pipeline::Stage;
use crate::pricing::{cost, ModelPricingTable};
use crate::tokens::TokenCounter;

#[derive(Debug, Clone)]
pub struct GuardCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub blocked_count: u64,
    pub estimated_cost: f64,
    pub current_hourly_spend: f64,
}

struct InflightEntry {
    normalized: String,
    started_at_ms: i64,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

/// A handle to an in-flight request registered by `start_request`. Dropping
/// it has no effect; call `is_cancelled()` to check whether a newer request
/// with the same normalized prompt displaced this one.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Per-request admission control, running after the circuit breaker and
/// user budget manager. Every check is synchronous and in-memory.
pub struct RequestGuard {
    config: GuardConfig,
    pricing: Arc<ModelPricingTable>,
    counter: Arc<dyn TokenCounter>,
    rate_limit_timestamps: Mutex<VecDeque<i64>>,
    recent_prompts: Mutex<HashMap<String, i64>>,
    last_allowed_time_ms: Mutex<Option<i64>>,
    cost_log: Mutex<VecDeque<(i64, f64)>>,
    inflight: Mutex<HashMap<String, InflightEntry>>,
    blocked_count: AtomicU64,
    total_saved: Mutex<f64>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGuard").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RequestGuard {
    pub fn new(config: GuardConfig, pricing: Arc<ModelPricingTable>, counter: Arc<dyn TokenCounter>) -> Self {
        Self::with_event_sink(config, pricing, counter, Arc::new(crate::events::NullEventSink))
    }

    pub fn with_event_sink(
        config: GuardConfig,
        pricing: Arc<ModelPricingTable>,
        counter: Arc<dyn TokenCounter>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            pricing,
            counter,
            rate_limit_timestamps: Mutex::new(VecDeque::new()),
            recent_prompts: Mutex::new(HashMap::new()),
            last_allowed_time_ms: Mutex::new(None),
            cost_log: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(HashMap::new()),
            blocked_count: AtomicU64::new(0),
            total_saved: Mutex::new(0.0),
            event_sink,
        }
    }

    fn block(&self, reason: &str, estimated_cost: f64) -> GuardCheckResult {
        let blocked_count = self.blocked_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.total_saved.lock().unwrap() += estimated_cost;
        self.event_sink.emit(PipelineEvent::RequestBlocked { reason: reason.to_string(), blocked_count });
        GuardCheckResult {
            allowed: false,
            reason: Some(reason.to_string()),
            blocked_count,
            estimated_cost,
            current_hourly_spend: self.hourly_spend(now_ms()),
        }
    }

    fn hourly_spend(&self, now_ms: i64) -> f64 {
        let cutoff = now_ms - 3_600_000;
        self.cost_log.lock().unwrap().iter().filter(|(ts, _)| *ts >= cutoff).map(|(_, c)| c).sum()
    }

    /// Run the full seven-check admission pipeline. On allow, records the
    /// timestamp (rate limit), normalized prompt (time-window dedup), and
    /// updates the debounce clock.
    pub fn check(&self, prompt: &str, model: &str, est_input_tokens: u32, est_output_tokens: u32) -> GuardCheckResult {
        let estimated_cost = cost(&self.pricing, model, est_input_tokens, est_output_tokens, 0);
        let now = now_ms();
        let normalized = normalize(prompt);

        // 1. minimum input length
        if prompt.chars().count() < self.config.min_input_length {
            return self.block("Input too short", estimated_cost);
        }

        // 2. maximum input tokens
        if let Some(max_tokens) = self.config.max_input_tokens {
            if est_input_tokens > max_tokens {
                return self.block("Input exceeds maximum token limit", estimated_cost);
            }
        }

        // 3. time-window dedup
        {
            let mut recent = self.recent_prompts.lock().unwrap();
            let window_ms = self.config.dedup_window.as_millis() as i64;
            recent.retain(|_, ts| now - *ts < window_ms);
            if recent.len() > self.config.max_recent_prompts {
                recent.clear();
            }
            if let Some(seen_at) = recent.get(&normalized) {
                if now - *seen_at < window_ms {
                    return self.block("Duplicate request within dedup window", estimated_cost);
                }
            }
        }

        // 4. debounce
        {
            let last = self.last_allowed_time_ms.lock().unwrap();
            let debounce_ms = self.config.debounce.as_millis() as i64;
            if let Some(last_ts) = *last {
                if now - last_ts < debounce_ms {
                    return self.block("Debounced: request arrived too soon", estimated_cost);
                }
            }
        }

        // 5. rate limit
        {
            let mut timestamps = self.rate_limit_timestamps.lock().unwrap();
            let minute_ago = now - 60_000;
            timestamps.retain(|ts| *ts >= minute_ago);
            if timestamps.len() as u32 >= self.config.max_requests_per_minute {
                return self.block("Rate limited: too many requests in the last minute", estimated_cost);
            }
        }

        // 6. hourly cost gate
        if let Some(max_cost) = self.config.max_cost_per_hour {
            let current_hourly = self.hourly_spend(now);
            if current_hourly + estimated_cost > max_cost {
                return self.block("Hourly cost limit exceeded", estimated_cost);
            }
        }

        // 7. in-flight dedup
        if self.config.dedup_inflight {
            let inflight = self.inflight.lock().unwrap();
            if inflight.values().any(|e| e.normalized == normalized && !e.cancelled.load(Ordering::Relaxed)) {
                return self.block("Duplicate in-flight request", estimated_cost);
            }
        }

        // allow: record state
        {
            let mut timestamps = self.rate_limit_timestamps.lock().unwrap();
            timestamps.push_back(now);
            while timestamps.len() > self.config.max_rate_limit_timestamps {
                timestamps.pop_front();
            }
        }
        self.recent_prompts.lock().unwrap().insert(normalized, now);
        *self.last_allowed_time_ms.lock().unwrap() = Some(now);

        self.event_sink.emit(PipelineEvent::RequestAllowed { estimated_cost });

        GuardCheckResult {
            allowed: true,
            reason: None,
            blocked_count: self.blocked_count.load(Ordering::Relaxed),
            estimated_cost,
            current_hourly_spend: self.hourly_spend(now),
        }
    }

    /// Register an in-flight record for `prompt`, cancelling any existing
    /// entry with the identical normalized prompt. Evicts entries older
    /// than 5 minutes once the map exceeds 50 entries.
    pub fn start_request(&self, prompt: &str) -> CancellationHandle {
        let normalized = normalize(prompt);
        let now = now_ms();
        let mut inflight = self.inflight.lock().unwrap();

        for (_, entry) in inflight.iter().filter(|(_, e)| e.normalized == normalized) {
            entry.cancelled.store(true, Ordering::Relaxed);
        }

        if inflight.len() > self.config.max_inflight_entries {
            let max_age_ms = self.config.inflight_max_age.as_millis() as i64;
            inflight.retain(|_, e| now - e.started_at_ms < max_age_ms);
        }

        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let id = uuid::Uuid::new_v4().to_string();
        inflight.insert(
            id,
            InflightEntry {
                normalized,
                started_at_ms: now,
                cancelled: cancelled.clone(),
            },
        );

        CancellationHandle { cancelled }
    }

    /// Unregister the in-flight record for `prompt` and append its actual
    /// cost to the hourly cost log.
    pub fn complete_request(&self, prompt: &str, actual_input_tokens: u32, actual_output_tokens: u32, model: &str) {
        let normalized = normalize(prompt);
        self.inflight.lock().unwrap().retain(|_, e| e.normalized != normalized);

        let actual_cost = cost(&self.pricing, model, actual_input_tokens, actual_output_tokens, 0);
        let mut log = self.cost_log.lock().unwrap();
        log.push_back((now_ms(), actual_cost));
        while log.len() > self.config.max_cost_log_entries {
            log.pop_front();
        }
    }

    /// Read-only statistics snapshot. Never mutates the cost log or any
    /// other internal state - safe to call from dry-run paths.
    pub fn get_stats(&self) -> GuardStats {
        GuardStats {
            blocked_count: self.blocked_count.load(Ordering::Relaxed),
            total_saved: *self.total_saved.lock().unwrap(),
            current_hourly_spend: self.hourly_spend(now_ms()),
            inflight_count: self.inflight.lock().unwrap().len(),
            rate_limit_window_count: self.rate_limit_timestamps.lock().unwrap().len(),
        }
    }

    /// Alias for `get_stats`, matching the `GetSnapshot` naming used by
    /// dry-run callers.
    pub fn get_snapshot(&self) -> GuardStats {
        self.get_stats()
    }
}

#[derive(Debug, Clone)]
pub struct GuardStats {
    pub blocked_count: u64,
    pub total_saved: f64,
    pub current_hourly_spend: f64,
    pub inflight_count: usize,
    pub rate_limit_window_count: usize,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Stage for RequestGuard {
    fn name(&self) -> &str {
        "guard"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        let est_input_tokens = self.counter.count_tokens(&ctx.last_user_text)?;
        let result = self.check(&ctx.last_user_text, &ctx.model_id, est_input_tokens, 0);
        if !result.allowed {
            ctx.abort(result.reason.unwrap_or_else(|| "request blocked".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod guard_tests {
    use super::*;
    use std::time::Duration;

    // UNIT UNDER TEST: RequestGuard's ordered admission checks
    // BUSINESS RESPONSIBILITY: each of the seven checks must block for its
    //   own documented reason string, read-only snapshots must never
    //   mutate state, and in-flight dedup must only fire for genuinely
    //   concurrent duplicate prompts.
    // TEST COVERAGE:
    //   - minimum length blocks short prompts
    //   - rate limit blocks the Nth+1 request within a minute
    //   - debounce blocks a request arriving before the debounce interval
    //   - time-window dedup blocks an identical prompt within the window
    //   - in-flight dedup blocks while the first request is still open
    //   - get_stats does not mutate the cost log

    fn guard(config: GuardConfig) -> RequestGuard {
        RequestGuard::new(
            config,
            Arc::new(ModelPricingTable::with_common_models()),
            Arc::new(crate::tokens::ApproximateTokenCounter::new().unwrap()),
        )
    }

    #[test]
    fn short_prompt_is_blocked_on_minimum_length() {
        // Arrange
        let g = guard(GuardConfig::default());

        // Act
        let result = g.check("h", "gpt-4o", 1, 1);

        // Assert
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("Input too short"));
    }

    #[test]
    fn rate_limit_blocks_after_max_requests_per_minute() {
        // Arrange
        let config = GuardConfig {
            debounce: Duration::from_millis(0),
            max_requests_per_minute: 3,
            ..Default::default()
        };
        let g = guard(config);

        // Act
        let results: Vec<GuardCheckResult> = (0..4)
            .map(|i| g.check(&format!("distinct prompt number {i}"), "gpt-4o", 10, 10))
            .collect();

        // Assert
        assert!(results[0].allowed);
        assert!(results[1].allowed);
        assert!(results[2].allowed);
        assert!(!results[3].allowed);
        assert!(results[3].reason.as_deref().unwrap().contains("Rate limited"));
    }

    #[test]
    fn debounce_blocks_a_request_arriving_too_soon() {
        // Arrange
        let config = GuardConfig {
            debounce: Duration::from_secs(60),
            ..Default::default()
        };
        let g = guard(config);

        // Act
        let first = g.check("first distinct prompt", "gpt-4o", 10, 10);
        let second = g.check("second distinct prompt", "gpt-4o", 10, 10);

        // Assert
        assert!(first.allowed);
        assert!(!second.allowed);
    }

    #[test]
    fn time_window_dedup_blocks_identical_prompt_within_window() {
        // Arrange
        let config = GuardConfig {
            debounce: Duration::from_millis(0),
            dedup_window: Duration::from_secs(60),
            ..Default::default()
        };
        let g = guard(config);

        // Act
        let first = g.check("what is the capital of France?", "gpt-4o", 10, 10);
        let second = g.check("What is the capital of France", "gpt-4o", 10, 10);

        // Assert
        assert!(first.allowed);
        assert!(!second.allowed);
        assert!(second.reason.as_deref().unwrap().contains("Duplicate"));
    }

    #[test]
    fn inflight_dedup_blocks_concurrent_identical_prompt() {
        // Arrange
        let config = GuardConfig {
            debounce: Duration::from_millis(0),
            dedup_window: Duration::from_millis(0),
            dedup_inflight: true,
            ..Default::default()
        };
        let g = guard(config);
        let _handle = g.start_request("concurrent prompt");

        // Act
        let result = g.check("concurrent prompt", "gpt-4o", 10, 10);

        // Assert
        assert!(!result.allowed);
        assert!(result.reason.as_deref().unwrap().contains("in-flight"));
    }

    #[test]
    fn starting_a_new_request_cancels_the_prior_identical_one() {
        // Arrange
        let g = guard(GuardConfig::default());
        let first_handle = g.start_request("duplicate prompt text");

        // Act
        let _second_handle = g.start_request("duplicate prompt text");

        // Assert
        assert!(first_handle.is_cancelled());
    }

    #[test]
    fn get_stats_does_not_mutate_cost_log() {
        // Arrange
        let g = guard(GuardConfig::default());
        g.complete_request("some prompt", 100, 50, "gpt-4o");

        // Act
        let before = g.get_stats().current_hourly_spend;
        let after = g.get_stats().current_hourly_spend;

        // Assert
        assert_eq!(before, after);
        assert!(before > 0.0);
    }

    #[test]
    fn allowed_and_blocked_checks_emit_matching_events() {
        // Arrange
        let sink = Arc::new(crate::events::RecordingEventSink::new());
        let g = RequestGuard::with_event_sink(
            GuardConfig { min_input_length: 2, ..GuardConfig::default() },
            Arc::new(ModelPricingTable::with_common_models()),
            Arc::new(crate::tokens::ApproximateTokenCounter::new().unwrap()),
            sink.clone(),
        );

        // Act
        g.check("a sufficiently long first prompt", "gpt-4o", 10, 10);
        g.check("h", "gpt-4o", 1, 1);
        let events = sink.drain();

        // Assert
        assert!(events.iter().any(|e| e.event_type() == "request:allowed"));
        assert!(events.iter().any(|e| e.event_type() == "request:blocked"));
    }
}
