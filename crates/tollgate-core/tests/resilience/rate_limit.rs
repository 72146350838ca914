use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tollgate_core::policy::{PolicyId, RateLimitPolicy, ServicePolicy, SlidingWindow};
use tollgate_core::{CallContext, GovernanceEngine, GovernanceError, HttpRequest, MockClock};

use super::{engine_with, publish};

fn call(engine: &GovernanceEngine) -> Result<(), GovernanceError> {
    let request = HttpRequest::new("search").with_path("/v1/query");
    engine
        .invoke_inbound(&request, CallContext::default(), |_| async {
            Ok::<_, GovernanceError>(())
        })
        .now_or_never()
        .expect("rate limiting never suspends")
}

#[test]
fn eleventh_call_in_the_window_is_rejected_until_the_window_rolls() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "search",
        ServicePolicy::default().with_rate_limit_policy(
            RateLimitPolicy::new(PolicyId::new(21, 1), "search-qps").with_window(SlidingWindow::new(10, 1_000)),
        ),
    );

    for n in 0..10 {
        assert!(call(&engine).is_ok(), "第 {n} 次调用在额度内");
    }
    let rejected = call(&engine).expect_err("第 11 次超出额度");
    assert_eq!(
        rejected,
        GovernanceError::RateLimited {
            policy_id: 21,
            threshold: 10,
            window_ms: 1_000
        }
    );
    assert_eq!(engine.stats().rate_limit, 1);
    assert_eq!(engine.stats().pass, 10);

    clock.advance(Duration::from_millis(999));
    assert!(call(&engine).is_err(), "周期未结束前仍拒绝");
    clock.advance(Duration::from_millis(1));
    assert!(call(&engine).is_ok(), "新周期恢复放行");
}

#[test]
fn every_window_must_have_room() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "search",
        ServicePolicy::default().with_rate_limit_policy(
            RateLimitPolicy::new(PolicyId::new(22, 1), "burst-and-sustained")
                .with_window(SlidingWindow::new(3, 1_000))
                .with_window(SlidingWindow::new(5, 10_000)),
        ),
    );

    for _ in 0..3 {
        call(&engine).expect("within both windows");
    }
    assert!(matches!(
        call(&engine),
        Err(GovernanceError::RateLimited { threshold: 3, .. })
    ));

    clock.advance(Duration::from_secs(1));
    for _ in 0..2 {
        call(&engine).expect("short window rolled over");
    }
    assert!(
        matches!(call(&engine), Err(GovernanceError::RateLimited { threshold: 5, window_ms: 10_000, .. })),
        "长窗口额度耗尽时即使短窗口仍有余量也拒绝"
    );

    let limiter = engine.caches().limiters().get(22).expect("cached limiter");
    assert_eq!(limiter.available(), Some(0));
}

#[test]
fn rejected_calls_do_not_consume_other_windows() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "search",
        ServicePolicy::default().with_rate_limit_policy(
            RateLimitPolicy::new(PolicyId::new(23, 1), "rl")
                .with_window(SlidingWindow::new(1, 1_000))
                .with_window(SlidingWindow::new(3, 60_000)),
        ),
    );

    call(&engine).expect("first call");
    for _ in 0..5 {
        assert!(call(&engine).is_err());
    }
    clock.advance(Duration::from_secs(1));
    call(&engine).expect("被拒绝的调用未占用长窗口额度");
    clock.advance(Duration::from_secs(1));
    call(&engine).expect("third slot of the long window");
}

#[test]
fn switch_disables_rate_limiting() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock, 0);
    publish(
        &engine,
        1,
        "search",
        ServicePolicy::default().with_rate_limit_policy(
            RateLimitPolicy::new(PolicyId::new(24, 1), "rl").with_window(SlidingWindow::new(0, 1_000)),
        ),
    );
    assert!(call(&engine).is_err(), "阈值为 0 拒绝全部调用");

    engine
        .config()
        .update_from_toml("[switches]\nrate_limit = false")
        .expect("valid config");
    assert!(call(&engine).is_ok());
}
