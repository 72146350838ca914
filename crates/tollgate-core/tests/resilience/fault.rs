use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tollgate_core::policy::{
    FaultInjectionPolicy, FaultKind, PolicyId, ServicePolicy, TagCondition, TagKind, TagOperator,
};
use tollgate_core::{
    CallContext, Clock, Deadline, Decision, GovernanceEngine, GovernanceError, HttpRequest, MockClock,
};

use super::{engine_with, publish};

fn error_fault(percent: i32) -> ServicePolicy {
    ServicePolicy::default().with_fault_injection_policy(
        FaultInjectionPolicy::new(PolicyId::new(31, 1), FaultKind::error(503, "chaos drill")).with_percent(percent),
    )
}

fn call(engine: &GovernanceEngine, request: &HttpRequest) -> (Result<Decision, GovernanceError>, bool) {
    let mut executed = false;
    let outcome = engine
        .invoke_inbound(request, CallContext::default(), |admission| {
            executed = true;
            async move { Ok::<_, GovernanceError>(admission.decision) }
        })
        .now_or_never()
        .expect("error faults never suspend");
    (outcome, executed)
}

#[test]
fn full_percent_always_injects_the_configured_error() {
    let engine = engine_with(Arc::new(MockClock::new()), 99);
    publish(&engine, 1, "ledger", error_fault(100));
    let request = HttpRequest::new("ledger");

    for _ in 0..3 {
        let (outcome, executed) = call(&engine, &request);
        assert!(!executed, "注入错误时不执行底层调用");
        assert_eq!(
            outcome,
            Err(GovernanceError::FaultInjected {
                policy_id: 31,
                code: 503,
                message: "chaos drill".into()
            })
        );
    }
    assert_eq!(engine.stats().fault_injected, 3);
}

#[test]
fn zero_percent_never_injects() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(&engine, 1, "ledger", error_fault(0));
    let (outcome, executed) = call(&engine, &HttpRequest::new("ledger"));
    assert!(executed);
    assert_eq!(outcome, Ok(Decision::Pass));
    assert_eq!(engine.stats().fault_injected, 0);
}

#[test]
fn partial_percent_compares_the_draw() {
    let engine = engine_with(Arc::new(MockClock::new()), 49);
    publish(&engine, 1, "ledger", error_fault(50));
    let request = HttpRequest::new("ledger");
    assert!(call(&engine, &request).0.is_err(), "抽样 49 < 50 命中");

    let engine = engine_with(Arc::new(MockClock::new()), 50);
    publish(&engine, 1, "ledger", error_fault(50));
    assert!(call(&engine, &request).0.is_ok(), "抽样 50 不小于 50，未命中");
}

#[test]
fn conditions_scope_the_fault_to_tagged_traffic() {
    let engine = engine_with(Arc::new(MockClock::new()), 0);
    publish(
        &engine,
        1,
        "ledger",
        ServicePolicy::default().with_fault_injection_policy(
            FaultInjectionPolicy::new(PolicyId::new(32, 1), FaultKind::error(500, "tagged only")).with_condition(
                TagCondition::new(TagKind::Header, "x-chaos", TagOperator::Equal, ["on"]),
            ),
        ),
    );

    assert!(call(&engine, &HttpRequest::new("ledger")).0.is_ok());
    let tagged = HttpRequest::new("ledger").with_header("X-Chaos", "on");
    assert!(matches!(
        call(&engine, &tagged).0,
        Err(GovernanceError::FaultInjected { policy_id: 32, code: 500, .. })
    ));
}

#[test]
fn delay_fault_suspends_on_the_clock() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "ledger",
        ServicePolicy::default().with_fault_injection_policy(FaultInjectionPolicy::new(
            PolicyId::new(33, 1),
            FaultKind::delay(Duration::from_millis(200)),
        )),
    );
    let request = HttpRequest::new("ledger");

    let mut delayed = Box::pin(engine.invoke_inbound(&request, CallContext::default(), |admission| async move {
        Ok::<_, GovernanceError>(admission.injected_delay)
    }));
    assert!(delayed.as_mut().now_or_never().is_none(), "延迟未到期前挂起");
    assert_eq!(clock.pending_sleepers(), 1);

    clock.advance(Duration::from_millis(200));
    let observed = delayed.as_mut().now_or_never().expect("delay elapsed");
    assert_eq!(observed, Ok(Duration::from_millis(200)));
    assert_eq!(engine.stats().fault_injected, 0, "延迟故障不拒绝调用");
    assert_eq!(engine.stats().pass, 1);
}

#[test]
fn delay_longer_than_the_deadline_reports_deadline_exceeded() {
    let clock = Arc::new(MockClock::new());
    let engine = engine_with(clock.clone(), 0);
    publish(
        &engine,
        1,
        "ledger",
        ServicePolicy::default().with_fault_injection_policy(FaultInjectionPolicy::new(
            PolicyId::new(34, 1),
            FaultKind::delay(Duration::from_secs(5)),
        )),
    );
    let request = HttpRequest::new("ledger");
    let call = CallContext::builder()
        .deadline(Deadline::with_timeout(clock.now(), Duration::from_millis(300)))
        .build();

    let mut executed = false;
    let mut delayed = Box::pin(engine.invoke_inbound(&request, call, |_| {
        executed = true;
        async { Ok::<_, GovernanceError>(()) }
    }));
    assert!(delayed.as_mut().now_or_never().is_none());
    clock.advance(Duration::from_millis(300));
    let outcome = delayed.as_mut().now_or_never().expect("deadline reached");
    assert!(matches!(outcome, Err(GovernanceError::DeadlineExceeded { .. })));
    drop(delayed);
    assert!(!executed);
}
