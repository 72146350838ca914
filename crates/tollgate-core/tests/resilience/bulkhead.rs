use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tollgate_core::policy::{ConcurrencyLimitPolicy, PolicyId, ServicePolicy};
use tollgate_core::resilience::ConcurrencyLimiter;
use tollgate_core::{CallContext, Deadline, GovernanceEngine, GovernanceError, HttpRequest, SystemClock};

use super::publish;

fn limiter(max: u32, wait: Duration) -> Arc<ConcurrencyLimiter> {
    let policy = ConcurrencyLimitPolicy::new(PolicyId::new(41, 1), "bulkhead", max).with_max_wait(wait);
    Arc::new(ConcurrencyLimiter::new(policy, Arc::new(SystemClock)).expect("valid policy"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_caller_receives_the_released_slot() {
    let limiter = limiter(2, Duration::from_secs(5));
    let first = limiter.try_acquire().expect("slot 1");
    let second = limiter.try_acquire().expect("slot 2");
    assert!(limiter.try_acquire().is_err(), "槽位已满时不排队的获取立即失败");

    let waiter = tokio::spawn({
        let limiter = Arc::clone(&limiter);
        async move { limiter.acquire(&CallContext::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "排队者等待槽位释放");

    drop(first);
    let third = waiter.await.expect("task").expect("released slot");
    assert_eq!(limiter.in_flight(), 2);
    drop(second);
    drop(third);
    assert_eq!(limiter.in_flight(), 0);
}

#[tokio::test]
async fn wait_is_bounded_by_max_wait() {
    let limiter = limiter(1, Duration::from_millis(30));
    let _held = limiter.try_acquire().expect("slot");
    let err = limiter
        .acquire(&CallContext::default())
        .await
        .expect_err("no slot frees up");
    assert_eq!(
        err,
        GovernanceError::ConcurrencyLimited {
            policy_id: 41,
            max_concurrency: 1
        }
    );
}

#[tokio::test]
async fn deadline_shorter_than_max_wait_wins() {
    let limiter = limiter(1, Duration::from_secs(10));
    let _held = limiter.try_acquire().expect("slot");
    let call = CallContext::builder()
        .deadline(Deadline::with_timeout(std::time::Instant::now(), Duration::from_millis(30)))
        .build();
    let err = limiter.acquire(&call).await.expect_err("deadline elapses first");
    assert!(matches!(err, GovernanceError::DeadlineExceeded { .. }));
}

#[tokio::test]
async fn engine_never_exceeds_max_concurrency() {
    let engine = GovernanceEngine::builder().build().expect("default config");
    publish(
        &engine,
        1,
        "render",
        ServicePolicy::default().with_concurrency_limit_policy(
            ConcurrencyLimitPolicy::new(PolicyId::new(42, 1), "render-bulkhead", 3)
                .with_max_wait(Duration::from_secs(5)),
        ),
    );
    let request = HttpRequest::new("render");
    let current = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);

    let calls = (0..12).map(|_| {
        engine.invoke_inbound(&request, CallContext::default(), |_| async {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, GovernanceError>(())
        })
    });
    let outcomes = join_all(calls).await;

    assert!(outcomes.iter().all(Result::is_ok), "排队上限足够，全部调用最终放行");
    assert_eq!(peak.load(Ordering::SeqCst), 3, "在途调用数不得超过隔离舱容量");
    let bulkhead = engine.caches().bulkheads().get(42).expect("cached");
    assert_eq!(bulkhead.in_flight(), 0);
    assert_eq!(engine.stats().pass, 12);
}

#[tokio::test]
async fn cancelled_executing_call_returns_its_slot() {
    let engine = GovernanceEngine::builder().build().expect("default config");
    publish(
        &engine,
        1,
        "export",
        ServicePolicy::default().with_concurrency_limit_policy(
            ConcurrencyLimitPolicy::new(PolicyId::new(43, 1), "export-bulkhead", 1)
                .with_max_wait(Duration::from_secs(5)),
        ),
    );
    let request = HttpRequest::new("export");

    let running = engine.invoke_inbound(&request, CallContext::default(), |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, GovernanceError>(())
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(20), running).await;
    assert!(timed_out.is_err(), "调用在执行中被外层超时取消");

    let bulkhead = engine.caches().bulkheads().get(43).expect("cached");
    assert_eq!(bulkhead.in_flight(), 0, "执行中被取消的调用必须归还槽位");
    let next = engine
        .invoke_inbound(&request, CallContext::default(), |_| async { Ok::<_, GovernanceError>(7) })
        .await;
    assert_eq!(next, Ok(7), "归还的槽位可立即被后续调用取得");
    let stats = engine.stats();
    assert_eq!(stats.pass, 2, "已开始执行的调用按放行计数");
    assert_eq!(stats.aborted, 0);
}
