//! Circuit Breaker - absolute spend caps over rolling time windows.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BreakerAction, BreakerConfig};
use crate::context::PipelineContext;
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::logging::{log_debug, log_warn};
use crate::pipeline::Stage;
use crate::pricing::{cost, ModelPricingTable};
use crate::storage::StorageAdapter;
use crate::tokens::TokenCounter;

const HOUR_SECONDS: i64 = 3600;
const DAY_SECONDS: i64 = 24 * HOUR_SECONDS;
const MONTH_SECONDS: i64 = 30 * DAY_SECONDS;
/// Sentinel used for percent-used when a window's limit is exactly zero,
/// to avoid reporting infinity.
const ZERO_LIMIT_PERCENT_SENTINEL: f64 = 999.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendRecord {
    pub timestamp: i64,
    pub cost: f64,
    pub model: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerWindow {
    Session,
    Hour,
    Day,
    Month,
}

impl BreakerWindow {
    fn label(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WindowStatus {
    pub window: &'static str,
    pub spend: f64,
    /// `None` when the window has no configured limit.
    pub remaining: Option<f64>,
    pub percent_used: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub windows: Vec<WindowStatus>,
    pub tripped_limits: Vec<(&'static str, f64)>,
    pub total_requests: u64,
    pub total_blocked: u64,
    pub tripped: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedBreakerState {
    records: Vec<SpendRecord>,
    total_blocked: u64,
}

/// Enforces absolute spend caps over rolling windows. A field set to
/// `Some(0.0)` blocks everything in that window; `None` means unlimited.
pub struct CircuitBreaker {
    config: BreakerConfig,
    pricing: Arc<ModelPricingTable>,
    counter: Arc<dyn TokenCounter>,
    records: Mutex<Vec<SpendRecord>>,
    session_start: i64,
    total_requests: AtomicU64,
    total_blocked: AtomicU64,
    warning_fired: Mutex<HashSet<&'static str>>,
    storage: Arc<dyn StorageAdapter>,
    storage_key: String,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(
        config: BreakerConfig,
        pricing: Arc<ModelPricingTable>,
        counter: Arc<dyn TokenCounter>,
        storage: Arc<dyn StorageAdapter>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            pricing,
            counter,
            records: Mutex::new(Vec::new()),
            session_start: now(),
            total_requests: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            warning_fired: Mutex::new(HashSet::new()),
            storage,
            storage_key: "breaker:default".to_string(),
            event_sink,
        }
    }

    fn window_start(&self, window: BreakerWindow, now_ts: i64) -> i64 {
        match window {
            BreakerWindow::Session => self.session_start,
            BreakerWindow::Hour => now_ts - HOUR_SECONDS,
            BreakerWindow::Day => now_ts - DAY_SECONDS,
            BreakerWindow::Month => now_ts - MONTH_SECONDS,
        }
    }

    fn limit_for(&self, window: BreakerWindow) -> Option<f64> {
        match window {
            BreakerWindow::Session => self.config.limits.per_session,
            BreakerWindow::Hour => self.config.limits.per_hour,
            BreakerWindow::Day => self.config.limits.per_day,
            BreakerWindow::Month => self.config.limits.per_month,
        }
    }

    fn spend_in_window(&self, records: &[SpendRecord], window: BreakerWindow, now_ts: i64) -> f64 {
        let start = self.window_start(window, now_ts);
        records
            .iter()
            .filter(|r| r.timestamp >= start)
            .map(|r| r.cost)
            .sum()
    }

    fn prune(&self, records: &mut Vec<SpendRecord>) {
        let cutoff = now() - self.config.retention.as_secs() as i64;
        records.retain(|r| r.timestamp >= cutoff);
        if records.len() > self.config.max_records {
            let excess = records.len() - self.config.max_records;
            records.drain(0..excess);
        }
    }

    /// Check whether a call of the given estimated size is admissible.
    /// Never panics or propagates an error - admission denial is a normal
    /// outcome, not a failure.
    pub fn check(&self, model: &str, est_input_tokens: u32, est_output_tokens: u32) -> BreakerCheckResult {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let estimated_cost = cost(&self.pricing, model, est_input_tokens, est_output_tokens, 0);
        let now_ts = now();
        let records = self.records.lock().unwrap();

        let windows = [
            BreakerWindow::Session,
            BreakerWindow::Hour,
            BreakerWindow::Day,
            BreakerWindow::Month,
        ];

        let mut warning_fired = self.warning_fired.lock().unwrap();
        let mut result = BreakerCheckResult {
            allowed: true,
            reason: None,
        };

        for window in windows {
            let Some(limit) = self.limit_for(window) else {
                continue;
            };
            let current = self.spend_in_window(&records, window, now_ts);
            let projected = current + estimated_cost;
            let percent_used = if limit == 0.0 {
                ZERO_LIMIT_PERCENT_SENTINEL
            } else {
                (projected / limit) * 100.0
            };

            let label = window.label();
            if percent_used >= self.config.warning_threshold * 100.0 && !warning_fired.contains(label) {
                warning_fired.insert(label);
                self.event_sink.emit(PipelineEvent::BreakerWarning {
                    window: label.to_string(),
                    percent_used,
                });
            } else if percent_used < self.config.warning_threshold * 100.0 {
                warning_fired.remove(label);
            }

            if projected >= limit {
                let reason = format!("circuit breaker tripped: {label} spend would reach {projected:.2} of {limit:.2} limit");
                self.event_sink.emit(PipelineEvent::BreakerTripped {
                    window: label.to_string(),
                    percent_used,
                });
                log_warn!(window = label, percent_used = percent_used, "breaker tripped");

                match self.config.action {
                    BreakerAction::Stop => {
                        self.total_blocked.fetch_add(1, Ordering::Relaxed);
                        return BreakerCheckResult {
                            allowed: false,
                            reason: Some(reason),
                        };
                    }
                    BreakerAction::Throttle => {
                        result.reason = Some(format!("Throttled: {reason}"));
                    }
                    BreakerAction::Warn => {}
                }
            }
        }

        result
    }

    /// Record an actual or estimated spend. Call this after the provider
    /// responds (with actual cost) or at admission time (with an estimate,
    /// to be corrected later) depending on the caller's accounting model.
    pub async fn record_spend(&self, model: &str, cost_usd: f64, user_id: Option<String>) {
        {
            let mut records = self.records.lock().unwrap();
            records.push(SpendRecord {
                timestamp: now(),
                cost: cost_usd,
                model: model.to_string(),
                user_id,
            });
            self.prune(&mut records);
        }
        self.persist_if_enabled().await;
    }

    pub fn status(&self) -> BreakerStatus {
        let now_ts = now();
        let records = self.records.lock().unwrap();
        let mut windows = Vec::new();
        let mut tripped_limits = Vec::new();

        for window in [
            BreakerWindow::Session,
            BreakerWindow::Hour,
            BreakerWindow::Day,
            BreakerWindow::Month,
        ] {
            let spend = self.spend_in_window(&records, window, now_ts);
            let limit = self.limit_for(window);
            let (remaining, percent_used) = match limit {
                Some(l) => {
                    let pct = if l == 0.0 {
                        ZERO_LIMIT_PERCENT_SENTINEL
                    } else {
                        (spend / l) * 100.0
                    };
                    if spend >= l {
                        tripped_limits.push((window.label(), pct));
                    }
                    (Some((l - spend).max(0.0)), Some(pct))
                }
                None => (None, None),
            };
            windows.push(WindowStatus {
                window: window.label(),
                spend,
                remaining,
                percent_used,
            });
        }

        let tripped = self.config.action == BreakerAction::Stop && !tripped_limits.is_empty();

        BreakerStatus {
            windows,
            tripped_limits,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            tripped,
        }
    }

    /// Reset all recorded spend and counters for the given window label
    /// (or every window when `None`). Session start is not reset by this -
    /// a new session begins only at process start.
    pub fn reset(&self, window: Option<&str>) {
        match window {
            None => {
                self.records.lock().unwrap().clear();
                self.total_blocked.store(0, Ordering::Relaxed);
            }
            Some(label) => {
                let cutoff = match label {
                    "hour" => now() - HOUR_SECONDS,
                    "day" => now() - DAY_SECONDS,
                    "month" => now() - MONTH_SECONDS,
                    _ => self.session_start,
                };
                self.records.lock().unwrap().retain(|r| r.timestamp < cutoff);
            }
        }
        self.warning_fired.lock().unwrap().clear();
    }

    async fn persist_if_enabled(&self) {
        if !self.config.persist {
            return;
        }
        let (records, total_blocked) = {
            let records = self.records.lock().unwrap();
            (records.clone(), self.total_blocked.load(Ordering::Relaxed))
        };
        let state = PersistedBreakerState {
            records,
            total_blocked,
        };
        match serde_json::to_string(&state) {
            Ok(payload) => {
                if let Err(e) = self.storage.set(&self.storage_key, &payload).await {
                    log_debug!(error = %e, "breaker persistence failed");
                }
            }
            Err(e) => log_debug!(error = %e, "breaker state serialization failed"),
        }
    }

    /// Restore records (but not session start - each process start begins a
    /// new session) from the configured storage adapter.
    pub async fn hydrate(&self) {
        let Ok(Some(raw)) = self.storage.get(&self.storage_key).await else {
            return;
        };
        if let Ok(state) = serde_json::from_str::<PersistedBreakerState>(&raw) {
            let mut records = self.records.lock().unwrap();
            *records = state.records;
            self.total_blocked.store(state.total_blocked, Ordering::Relaxed);
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Stage for CircuitBreaker {
    fn name(&self) -> &str {
        "breaker"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        // Output size isn't known before the provider responds; only the
        // pending call's input cost is projected here.
        let est_input_tokens = self.counter.count_tokens(&ctx.last_user_text)?;
        let result = self.check(&ctx.model_id, est_input_tokens, 0);
        if !result.allowed {
            ctx.abort(result.reason.unwrap_or_else(|| "breaker tripped".to_string()));
        } else if let Some(reason) = result.reason {
            ctx.meta.extra.insert("breakerThrottleReason".to_string(), reason);
        }
        Ok(())
    }
}
