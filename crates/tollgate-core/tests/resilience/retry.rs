use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tollgate_core::policy::{FailoverPolicy, PolicyId, RateLimitPolicy, ServicePolicy, SlidingWindow};
use tollgate_core::{
    CallContext, CarrierSlot, GovernanceEngine, GovernanceError, Idempotency, MockClock, RpcRequest,
    UpstreamError,
};

use super::{engine_with, publish};

fn failover(attempts: u32) -> FailoverPolicy {
    let mut policy = FailoverPolicy::new(PolicyId::new(51, 1), attempts);
    policy.retryable_statuses = vec![503];
    policy
}

/// 每次尝试都以给定状态码失败，返回结果与实际尝试次数。
fn always_failing(engine: &GovernanceEngine, call: CallContext, status: u16) -> (Result<(), GovernanceError>, u32) {
    let request = RpcRequest::new("stock");
    let attempts = Cell::new(0);
    let outcome = engine
        .invoke_outbound(&request, call, &CarrierSlot::new(), |admission| {
            attempts.set(attempts.get() + 1);
            assert_eq!(admission.attempt, attempts.get(), "尝试序号从 1 递增");
            async move { Err::<(), _>(GovernanceError::from(UpstreamError::new("unavailable").with_status(status))) }
        })
        .now_or_never()
        .expect("zero backoff never suspends");
    (outcome, attempts.get())
}

#[test]
fn retryable_status_is_replayed_until_exhausted() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(&engine, 1, "stock", ServicePolicy::default().with_failover_policy(failover(3)));

    let (outcome, attempts) = always_failing(&engine, CallContext::default(), 503);
    assert_eq!(attempts, 3);
    match outcome {
        Err(GovernanceError::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last.status(), Some(503));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[test]
fn non_idempotent_calls_run_once() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(&engine, 1, "stock", ServicePolicy::default().with_failover_policy(failover(3)));

    let call = CallContext::builder().idempotency(Idempotency::NonIdempotent).build();
    let (outcome, attempts) = always_failing(&engine, call, 503);
    assert_eq!(attempts, 1, "非幂等调用不得重放");
    assert!(matches!(outcome, Err(GovernanceError::Upstream(_))));
}

#[test]
fn status_outside_the_list_stops_immediately() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(&engine, 1, "stock", ServicePolicy::default().with_failover_policy(failover(3)));

    let (outcome, attempts) = always_failing(&engine, CallContext::default(), 400);
    assert_eq!(attempts, 1);
    assert_eq!(outcome.expect_err("upstream error").upstream().and_then(UpstreamError::status), Some(400));
}

#[test]
fn configured_default_requires_declared_idempotency() {
    let engine = GovernanceEngine::builder()
        .clock(Arc::new(MockClock::new()))
        .config(
            tollgate_core::GovernanceConfig::from_toml_str("[retry]\nrequire_idempotent = true")
                .expect("valid config"),
        )
        .build()
        .expect("engine");
    publish(&engine, 1, "stock", ServicePolicy::default().with_failover_policy(failover(3)));

    let (_, attempts) = always_failing(&engine, CallContext::default(), 503);
    assert_eq!(attempts, 1, "未声明幂等时按配置默认值不重试");
    let declared = CallContext::builder().idempotency(Idempotency::Idempotent).build();
    let (_, attempts) = always_failing(&engine, declared, 503);
    assert_eq!(attempts, 3);
}

#[test]
fn succeeds_on_a_later_attempt_after_backoff() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "stock",
        ServicePolicy::default().with_failover_policy(failover(3).with_interval(Duration::from_millis(100))),
    );
    let request = RpcRequest::new("stock");
    let attempts = Cell::new(0);

    let carrier = CarrierSlot::new();
    let mut pending = Box::pin(engine.invoke_outbound(
        &request,
        CallContext::default(),
        &carrier,
        |admission| {
            attempts.set(attempts.get() + 1);
            async move {
                if admission.attempt < 2 {
                    Err(GovernanceError::from(UpstreamError::new("busy").with_status(503)))
                } else {
                    Ok(admission.attempt)
                }
            }
        },
    ));
    assert!(pending.as_mut().now_or_never().is_none(), "首次失败后进入退避");
    assert_eq!(attempts.get(), 1);

    clock.advance(Duration::from_millis(100));
    let outcome = pending.as_mut().now_or_never().expect("backoff elapsed");
    assert_eq!(outcome, Ok(2));
    drop(pending);
    assert_eq!(attempts.get(), 2);
}

#[test]
fn each_attempt_passes_through_the_rate_limiter() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(
        &engine,
        1,
        "stock",
        ServicePolicy::default()
            .with_failover_policy(failover(3))
            .with_rate_limit_policy(
                RateLimitPolicy::new(PolicyId::new(52, 1), "stock-rl").with_window(SlidingWindow::new(2, 60_000)),
            ),
    );

    let (outcome, attempts) = always_failing(&engine, CallContext::default(), 503);
    assert_eq!(attempts, 2, "第三次尝试在进入前被限流");
    assert!(
        matches!(outcome, Err(GovernanceError::RateLimited { policy_id: 52, .. })),
        "治理拒绝不再重试，原样返回"
    );
    assert_eq!(engine.stats().rate_limit, 1);
}

#[test]
fn busy_looking_success_is_replayed_when_the_caller_asks() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(&engine, 1, "stock", ServicePolicy::default().with_failover_policy(failover(3)));
    let request = RpcRequest::new("stock");
    let attempts = Cell::new(0);

    let outcome = engine
        .invoke_outbound_when(
            &request,
            CallContext::default(),
            &CarrierSlot::new(),
            |body: &&str| *body == "busy",
            |admission| {
                attempts.set(attempts.get() + 1);
                let body = if admission.attempt < 2 { "busy" } else { "ok" };
                async move { Ok::<_, GovernanceError>(body) }
            },
        )
        .now_or_never()
        .expect("zero backoff never suspends");
    assert_eq!(outcome, Ok("ok"));
    assert_eq!(attempts.get(), 2, "繁忙结果触发一次重放");

    attempts.set(0);
    let exhausted = engine
        .invoke_outbound_when(
            &request,
            CallContext::default(),
            &CarrierSlot::new(),
            |body: &&str| *body == "busy",
            |_| {
                attempts.set(attempts.get() + 1);
                async { Ok::<_, GovernanceError>("busy") }
            },
        )
        .now_or_never()
        .expect("zero backoff never suspends");
    assert_eq!(exhausted, Ok("busy"), "尝试用尽时原样返回最后一次成功结果");
    assert_eq!(attempts.get(), 3);
}
