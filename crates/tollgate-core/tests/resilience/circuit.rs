use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tollgate_core::policy::{CircuitBreakPolicy, DegradeConfig, PolicyId, ServicePolicy};
use tollgate_core::resilience::CircuitState;
use tollgate_core::{CallContext, GovernanceEngine, GovernanceError, HttpRequest, MockClock, UpstreamError};
use tracing_test::traced_test;

use super::{engine_with, publish};

fn breaker_policy() -> CircuitBreakPolicy {
    let mut policy = CircuitBreakPolicy::new(PolicyId::new(11, 1), "payment-cb");
    policy.sliding_window_size = Some(4);
    policy.min_calls_threshold = Some(4);
    policy.failure_rate_threshold = Some(50.0);
    policy.wait_duration_in_open_state_ms = Some(1_000);
    policy.permitted_calls_in_half_open_state = Some(2);
    policy.degrade_config = Some(DegradeConfig {
        response_code: 503,
        body: Some("payment degraded".into()),
        ..DegradeConfig::default()
    });
    policy
}

fn call(engine: &GovernanceEngine, fail: bool) -> (Result<(), GovernanceError>, bool) {
    let request = HttpRequest::new("payment");
    let mut executed = false;
    let outcome = engine
        .invoke_inbound(&request, CallContext::default(), |_| {
            executed = true;
            async move {
                if fail {
                    Err(GovernanceError::from(UpstreamError::new("gateway timeout").with_status(504)))
                } else {
                    Ok(())
                }
            }
        })
        .now_or_never()
        .expect("no suspension");
    (outcome, executed)
}

#[test]
#[traced_test]
fn opens_rejects_then_admits_only_the_permitted_trials() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "payment",
        ServicePolicy::default().with_circuit_break_policy(breaker_policy()),
    );

    for fail in [true, false, true] {
        assert!(call(&engine, fail).1);
    }
    let breaker = engine.caches().breakers().get(11).expect("breaker cached");
    assert_eq!(breaker.state(), CircuitState::Closed, "未达到最小调用数前保持闭合");
    call(&engine, false);
    assert_eq!(breaker.state(), CircuitState::Open, "失败率 50% 达到阈值");

    let (rejected, executed) = call(&engine, false);
    assert!(!executed, "打开态不得执行底层调用");
    match rejected {
        Err(GovernanceError::CircuitBreakerOpen { policy_id, degrade }) => {
            assert_eq!(policy_id, 11);
            assert_eq!(degrade.and_then(|d| d.body).as_deref(), Some("payment degraded"));
        }
        other => panic!("expected circuit rejection, got {other:?}"),
    }
    assert!(logs_contain("circuit breaker rejected call"));
    assert_eq!(engine.stats().circuit_break, 1);

    clock.advance(Duration::from_millis(999));
    assert!(breaker.acquire().is_err(), "等待期未满仍然拒绝");
    clock.advance(Duration::from_millis(1));
    let first = breaker.acquire().expect("first trial");
    let second = breaker.acquire().expect("second trial");
    assert!(first.is_trial() && second.is_trial());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.acquire().is_err(), "半开态恰好放行两个试探");

    breaker.on_success(first, Duration::from_millis(5));
    breaker.on_success(second, Duration::from_millis(5));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(call(&engine, false).0.is_ok());
}

#[test]
fn rejection_by_a_later_gate_returns_the_trial_slot() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    let mut policy = breaker_policy();
    policy.permitted_calls_in_half_open_state = Some(1);
    publish(
        &engine,
        1,
        "payment",
        ServicePolicy::default()
            .with_circuit_break_policy(policy)
            .with_rate_limit_policy(
                tollgate_core::policy::RateLimitPolicy::new(PolicyId::new(12, 1), "rl")
                    .with_window(tollgate_core::policy::SlidingWindow::new(4, 60_000)),
            ),
    );
    for _ in 0..4 {
        call(&engine, true);
    }
    let breaker = engine.caches().breakers().get(11).expect("breaker cached");
    assert_eq!(breaker.state(), CircuitState::Open);

    // 限流窗口已耗尽：半开试探被限流拒绝后必须交回名额。
    clock.advance(Duration::from_millis(1_000));
    let (outcome, executed) = call(&engine, false);
    assert!(matches!(outcome, Err(GovernanceError::RateLimited { .. })));
    assert!(!executed);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    let trial = breaker.acquire().expect("trial slot was returned");
    breaker.release(trial);
}
