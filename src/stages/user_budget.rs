//! User Budget Manager - per-user rolling spend caps with in-flight
//! reservation, running after the circuit breaker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::UserBudgetConfig;
use crate::context::PipelineContext;
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::Stage;
use crate::pricing::{cost, ModelPricingTable};
use crate::tokens::TokenCounter;

const DAY_SECONDS: i64 = 24 * 3600;
const MONTH_SECONDS: i64 = 30 * DAY_SECONDS;
const WARNING_MAX_AGE_SECONDS: i64 = 30 * DAY_SECONDS;
const WARNING_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct SpendRecord {
    pub timestamp: i64,
    pub cost: f64,
    pub model: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

impl BudgetWindow {
    fn label(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    fn seconds(self) -> i64 {
        match self {
            Self::Daily => DAY_SECONDS,
            Self::Monthly => MONTH_SECONDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetCheckResult {
    pub allowed: bool,
    pub is_over_budget: bool,
    pub reason: Option<String>,
}

/// A handle to a tentative budget reservation. Dropping it without calling
/// `release` or letting a subsequent `record_spend` replace it leaves the
/// reservation in place - callers must explicitly release on failure.
#[derive(Debug, Clone)]
pub struct InflightReservation {
    pub user_id: String,
    pub amount: f64,
}

struct WarningEntry {
    key: String,
    timestamp: i64,
}

/// Per-user rolling spend caps (daily/monthly) plus an in-flight
/// reservation map so concurrent requests from the same user cannot both
/// squeeze under the limit.
pub struct UserBudgetManager {
    config: UserBudgetConfig,
    pricing: Arc<ModelPricingTable>,
    counter: Arc<dyn TokenCounter>,
    records: Mutex<Vec<SpendRecord>>,
    inflight: Mutex<HashMap<String, f64>>,
    inflight_order: Mutex<VecDeque<String>>,
    warning_fired: Mutex<(HashSet<String>, VecDeque<WarningEntry>)>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for UserBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserBudgetManager").finish_non_exhaustive()
    }
}

impl UserBudgetManager {
    pub fn new(
        config: UserBudgetConfig,
        pricing: Arc<ModelPricingTable>,
        counter: Arc<dyn TokenCounter>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            pricing,
            counter,
            records: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
            inflight_order: Mutex::new(VecDeque::new()),
            warning_fired: Mutex::new((HashSet::new(), VecDeque::new())),
            event_sink,
        }
    }

    fn spend_in_window(&self, records: &[SpendRecord], user_id: &str, window: BudgetWindow, now_ts: i64) -> f64 {
        let start = now_ts - window.seconds();
        records
            .iter()
            .filter(|r| r.user_id == user_id && r.timestamp >= start)
            .map(|r| r.cost)
            .sum()
    }

    fn inflight_for(&self, user_id: &str) -> f64 {
        self.inflight.lock().unwrap().get(user_id).copied().unwrap_or(0.0)
    }

    fn fire_warning(&self, user_id: &str, window: BudgetWindow) {
        let key = format!("{user_id}:{}", window.label());
        let mut guard = self.warning_fired.lock().unwrap();
        let (set, order) = &mut *guard;
        if set.contains(&key) {
            return;
        }
        let now_ts = now();
        let cutoff = now_ts - WARNING_MAX_AGE_SECONDS;
        while let Some(front) = order.front() {
            if front.timestamp < cutoff {
                set.remove(&order.pop_front().unwrap().key);
            } else {
                break;
            }
        }
        while order.len() >= self.config.max_warning_entries {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted.key);
            } else {
                break;
            }
        }
        set.insert(key.clone());
        order.push_back(WarningEntry { key, timestamp: now_ts });
        drop(guard);
        self.event_sink.emit(PipelineEvent::UserBudgetWarning {
            user_id: user_id.to_string(),
            window: window.label().to_string(),
        });
    }

    fn clear_warning(&self, user_id: &str, window: BudgetWindow) {
        let key = format!("{user_id}:{}", window.label());
        self.warning_fired.lock().unwrap().0.remove(&key);
    }

    /// Check admission for `user_id` given an estimated cost, seeing
    /// `spend + inflight` rather than just `spend`.
    pub fn check(&self, user_id: &str, model: &str, est_input_tokens: u32, est_output_tokens: u32) -> BudgetCheckResult {
        let limits = self.config.limits_for(user_id);
        let estimated_cost = cost(&self.pricing, model, est_input_tokens, est_output_tokens, 0);
        let now_ts = now();
        let records = self.records.lock().unwrap();
        let inflight = self.inflight_for(user_id);

        for (window, limit) in [(BudgetWindow::Daily, limits.daily), (BudgetWindow::Monthly, limits.monthly)] {
            let Some(limit) = limit else { continue };
            if limit == 0.0 {
                continue;
            }
            let spend = self.spend_in_window(&records, user_id, window, now_ts);
            let projected = spend + inflight + estimated_cost;
            let percent_used = (projected / limit) * 100.0;

            if percent_used >= WARNING_THRESHOLD * 100.0 {
                self.fire_warning(user_id, window);
            } else {
                self.clear_warning(user_id, window);
            }

            if projected >= limit {
                self.event_sink.emit(PipelineEvent::UserBudgetExceeded {
                    user_id: user_id.to_string(),
                    window: window.label().to_string(),
                });
                return BudgetCheckResult {
                    allowed: false,
                    is_over_budget: true,
                    reason: Some(format!(
                        "user budget exceeded: {} spend+inflight {projected:.4} >= limit {limit:.4}",
                        window.label()
                    )),
                };
            }
        }

        BudgetCheckResult {
            allowed: true,
            is_over_budget: false,
            reason: None,
        }
    }

    /// Tentatively reserve `estimated_cost` against `user_id`'s in-flight
    /// total. Evicts the oldest distinct user (FIFO) if the map is at
    /// capacity and `user_id` is new.
    pub fn reserve_inflight(&self, user_id: &str, estimated_cost: f64) -> InflightReservation {
        let mut inflight = self.inflight.lock().unwrap();
        let mut order = self.inflight_order.lock().unwrap();
        if !inflight.contains_key(user_id) {
            while inflight.len() >= self.config.max_inflight_users {
                if let Some(evicted) = order.pop_front() {
                    inflight.remove(&evicted);
                } else {
                    break;
                }
            }
            order.push_back(user_id.to_string());
        }
        *inflight.entry(user_id.to_string()).or_insert(0.0) += estimated_cost;
        InflightReservation {
            user_id: user_id.to_string(),
            amount: estimated_cost,
        }
    }

    /// Release a reservation without recording any spend - used when a
    /// later stage fails after the reservation was taken.
    pub fn release_inflight(&self, reservation: &InflightReservation) {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(total) = inflight.get_mut(&reservation.user_id) {
            *total = (*total - reservation.amount).max(0.0);
        }
    }

    /// Record actual spend, releasing the matching reservation (if any) in
    /// the same step so the estimate never double-counts against the
    /// in-flight total.
    pub fn record_spend(&self, reservation: Option<&InflightReservation>, model: &str, actual_cost: f64, user_id: &str) {
        if let Some(r) = reservation {
            self.release_inflight(r);
        }
        let mut records = self.records.lock().unwrap();
        records.push(SpendRecord {
            timestamp: now(),
            cost: actual_cost,
            model: model.to_string(),
            user_id: user_id.to_string(),
        });
        let cutoff = now() - MONTH_SECONDS;
        records.retain(|r| r.timestamp >= cutoff);
        if records.len() > 50_000 {
            let excess = records.len() - 50_000;
            records.drain(0..excess);
        }
    }

    /// The model `user_id`'s tier should be routed to, if `tier_models` has
    /// an entry for their resolved tier.
    fn tier_model_for(&self, user_id: &str) -> Option<String> {
        let tier = self.config.limits_for(user_id).tier?;
        self.config.tier_models.get(&tier).cloned()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Stage wiring: resolves `ctx.meta.user_id`, checks the budget, reserves
/// the estimated cost on success. Skips entirely when no user ID is set
/// (per-user quotas are opt-in).
#[async_trait]
impl Stage for UserBudgetManager {
    fn name(&self) -> &str {
        "user_budget"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        let Some(user_id) = ctx.meta.user_id.clone() else {
            return Ok(());
        };

        if let Some(tier_model) = self.tier_model_for(&user_id) {
            if tier_model != ctx.model_id {
                if ctx.meta.original_model.is_none() {
                    ctx.meta.original_model = Some(ctx.model_id.clone());
                }
                ctx.model_id = tier_model;
                ctx.meta.tier_routed = true;
            }
        }

        let est_input_tokens = self.counter.count_tokens(&ctx.last_user_text)?;
        let result = self.check(&user_id, &ctx.model_id, est_input_tokens, 0);
        if !result.allowed {
            ctx.abort(result.reason.unwrap_or_else(|| "user budget exceeded".to_string()));
            return Ok(());
        }

        let estimated_cost = cost(&self.pricing, &ctx.model_id, est_input_tokens, 0, 0);
        let reservation = self.reserve_inflight(&user_id, estimated_cost);
        ctx.meta.user_budget_inflight = reservation.amount;
        Ok(())
    }
}
