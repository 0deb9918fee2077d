//! The pipeline event bus and callback surface.
//!
//! Every admission decision, cache outcome, and accounting event is both
//! exposed through optional callbacks (see [`Hooks`]) and emitted as a
//! [`PipelineEvent`] so an observer can subscribe once rather than wiring a
//! callback per concern. Event delivery is best-effort: a failing listener
//! is logged and otherwise ignored, it never aborts the pipeline.

use crate::logging::log_debug;

/// Named pipeline events, matching the event bus required by the external
/// interface surface.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RequestAllowed { estimated_cost: f64 },
    RequestBlocked { reason: String, blocked_count: u64 },
    CacheHit { similarity: f64 },
    CacheMiss,
    LedgerEntry { id: String, total_saved: f64 },
    ContextTrimmed { tokens_evicted: u32 },
    RouterDowngraded { from_model: String, to_model: String },
    RouterHoldback,
    BreakerWarning { window: String, percent_used: f64 },
    BreakerTripped { window: String, percent_used: f64 },
    UserBudgetWarning { user_id: String, window: String },
    UserBudgetExceeded { user_id: String, window: String },
}

impl PipelineEvent {
    /// Stable event-type string, matching the names in the external
    /// interface surface (`request:allowed`, `cache:hit`, ...).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestAllowed { .. } => "request:allowed",
            Self::RequestBlocked { .. } => "request:blocked",
            Self::CacheHit { .. } => "cache:hit",
            Self::CacheMiss => "cache:miss",
            Self::LedgerEntry { .. } => "ledger:entry",
            Self::ContextTrimmed { .. } => "context:trimmed",
            Self::RouterDowngraded { .. } => "router:downgraded",
            Self::RouterHoldback => "router:holdback",
            Self::BreakerWarning { .. } => "breaker:warning",
            Self::BreakerTripped { .. } => "breaker:tripped",
            Self::UserBudgetWarning { .. } => "userBudget:warning",
            Self::UserBudgetExceeded { .. } => "userBudget:exceeded",
        }
    }
}

/// A sink for pipeline events. Implement this to wire events into your own
/// observability stack; [`NullEventSink`] discards everything.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// The default sink: events are logged at debug and otherwise discarded.
#[derive(Debug, Default, Clone)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, event: PipelineEvent) {
        log_debug!(event_type = event.event_type(), "pipeline event");
    }
}

/// An in-memory sink that records every event, for tests and for callers
/// that want to poll rather than subscribe.
#[derive(Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Optional per-outcome callbacks, mirroring the external interface's
/// callback surface. Each is independent of [`EventSink`] - a caller can use
/// either, both, or neither. Hook invocation failures are never allowed to
/// reach the pipeline; callers that need fallible hooks should catch inside
/// the closure itself.
#[derive(Default)]
pub struct Hooks {
    pub on_blocked: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_dry_run: Option<Box<dyn Fn(&str, &str, Option<f64>) + Send + Sync>>,
    pub on_warning: Option<Box<dyn Fn(&PipelineEvent) + Send + Sync>>,
    pub on_tripped: Option<Box<dyn Fn(&PipelineEvent) + Send + Sync>>,
    pub on_reset: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_budget_exceeded: Option<Box<dyn Fn(&str, &PipelineEvent) + Send + Sync>>,
    pub on_budget_warning: Option<Box<dyn Fn(&str, &PipelineEvent) + Send + Sync>>,
    pub on_storage_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod events_tests {
    use super::*;

    // UNIT UNDER TEST: RecordingEventSink and PipelineEvent::event_type
    // BUSINESS RESPONSIBILITY: every event's wire name must match the event
    //   bus contract exactly, and a sink must never lose events between
    //   emit() calls and drain().
    // TEST COVERAGE:
    //   - event_type strings match the required names
    //   - drain empties the sink and returns prior events in order

    #[test]
    fn cache_hit_event_type_matches_contract() {
        // Arrange
        let event = PipelineEvent::CacheHit { similarity: 1.0 };

        // Act / Assert
        assert_eq!(event.event_type(), "cache:hit");
    }

    #[test]
    fn recording_sink_preserves_emit_order_and_drains_once() {
        // Arrange
        let sink = RecordingEventSink::new();

        // Act
        sink.emit(PipelineEvent::CacheMiss);
        sink.emit(PipelineEvent::RouterHoldback);
        let drained = sink.drain();
        let after = sink.drain();

        // Assert
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].event_type(), "cache:miss");
        assert_eq!(drained[1].event_type(), "router:holdback");
        assert!(after.is_empty());
    }
}
