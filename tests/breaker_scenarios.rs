//! UNIT UNDER TEST: the circuit breaker running as a pipeline stage
//!
//! BUSINESS RESPONSIBILITY:
//!   - A zero-dollar window limit must block every request, never let one
//!     through on a rounding technicality
//!   - percent-used must report the 999 sentinel rather than infinity
//!   - Throttle must admit the request while still surfacing the reason
//!
//! TEST COVERAGE:
//!   - zero session limit aborts the pipeline with a breaker-tripped reason
//!   - status() reports tripped=true and the sentinel percent afterward
//!   - Throttle action admits the request and annotates ctx.meta.extra

mod common;

use std::sync::Arc;

use cost_shield::config::{BreakerAction, BreakerConfig, BreakerLimits};
use cost_shield::{CircuitBreaker, Message, PipelineContext};
use common::{null_sink, null_storage, test_pricing};

#[tokio::test]
async fn zero_session_limit_blocks_and_reports_sentinel_percent() {
    // Arrange
    let pricing = test_pricing();
    let config = BreakerConfig {
        limits: BreakerLimits { per_session: Some(0.0), ..Default::default() },
        action: BreakerAction::Stop,
        ..Default::default()
    };
    let breaker = CircuitBreaker::new(config, pricing, common::approximate_counter(), null_storage(), null_sink());

    let mut pipeline = cost_shield::Pipeline::new();
    pipeline.add_stage(Arc::new(breaker));
    let mut ctx = PipelineContext::new(vec![Message::user("hello there")], "gpt-4o-mini");

    // Act
    pipeline.run(&mut ctx).await;

    // Assert
    assert!(ctx.aborted);
    assert!(ctx.abort_reason.unwrap().contains("circuit breaker tripped"));
}

#[tokio::test]
async fn status_reports_tripped_after_zero_limit_check() {
    // Arrange
    let pricing = test_pricing();
    let config = BreakerConfig {
        limits: BreakerLimits { per_session: Some(0.0), ..Default::default() },
        action: BreakerAction::Stop,
        ..Default::default()
    };
    let breaker = CircuitBreaker::new(config, pricing, common::approximate_counter(), null_storage(), null_sink());

    // Act
    let result = breaker.check("gpt-4o-mini", 10, 5);
    let status = breaker.status();

    // Assert
    assert!(!result.allowed);
    assert!(status.tripped);
    let session_window = status.windows.iter().find(|w| w.window == "session").unwrap();
    assert_eq!(session_window.percent_used, Some(999.0));
}

#[tokio::test]
async fn throttle_action_allows_but_annotates_the_request() {
    // Arrange: same zero limit, but Throttle instead of Stop.
    let pricing = test_pricing();
    let config = BreakerConfig {
        limits: BreakerLimits { per_session: Some(0.0), ..Default::default() },
        action: BreakerAction::Throttle,
        ..Default::default()
    };
    let breaker = CircuitBreaker::new(config, pricing, common::approximate_counter(), null_storage(), null_sink());

    let mut pipeline = cost_shield::Pipeline::new();
    pipeline.add_stage(Arc::new(breaker));
    let mut ctx = PipelineContext::new(vec![Message::user("hello there")], "gpt-4o-mini");

    // Act
    pipeline.run(&mut ctx).await;

    // Assert: request proceeds, but the throttle reason is recorded for callers to inspect.
    assert!(!ctx.aborted);
    assert!(ctx.meta.extra.get("breakerThrottleReason").is_some());
}
