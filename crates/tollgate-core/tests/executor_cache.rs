//! 执行器缓存：版本只增不减，并发构造只有一个胜出者。

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use tollgate_core::policy::{PolicyId, RateLimitPolicy, SlidingWindow};
use tollgate_core::resilience::SlidingWindowRateLimiter;
use tollgate_core::{MockClock, VersionedExecutor, VersionedExecutorFactory};

fn policy(id: i64, version: i64) -> RateLimitPolicy {
    RateLimitPolicy::new(PolicyId::new(id, version), "rl").with_window(SlidingWindow::new(10, 1000))
}

fn build(clock: &Arc<MockClock>) -> impl Fn(&RateLimitPolicy) -> Result<SlidingWindowRateLimiter, tollgate_core::PolicyError> + '_ {
    move |p: &RateLimitPolicy| SlidingWindowRateLimiter::new(p.clone(), clock.clone())
}

proptest! {
    /// 任意版本序列下，缓存版本等于迄今见过的最大版本。
    #[test]
    fn cached_version_never_regresses(versions in proptest::collection::vec(1i64..50, 1..40)) {
        let clock = Arc::new(MockClock::new());
        let cache = VersionedExecutorFactory::<SlidingWindowRateLimiter>::new();
        let mut highest = i64::MIN;
        for version in versions {
            let executor = cache.get_or_create(&policy(1, version), build(&clock)).expect("valid policy");
            highest = highest.max(version);
            prop_assert_eq!(executor.version(), highest);
            prop_assert_eq!(cache.get(1).map(|e| e.version()), Some(highest));
        }
    }
}

#[test]
fn same_version_reuses_the_executor() {
    let clock = Arc::new(MockClock::new());
    let cache = VersionedExecutorFactory::<SlidingWindowRateLimiter>::new();
    let first = cache.get_or_create(&policy(1, 3), build(&clock)).expect("valid");
    let second = cache.get_or_create(&policy(1, 3), build(&clock)).expect("valid");
    assert!(Arc::ptr_eq(&first, &second), "同版本必须复用同一执行器，窗口计数才能延续");
    let older = cache.get_or_create(&policy(1, 2), build(&clock)).expect("valid");
    assert!(Arc::ptr_eq(&first, &older), "旧版本策略不得覆盖新执行器");
    assert_eq!(cache.builds(), 1);
}

#[test]
fn invalid_policy_leaves_the_cache_untouched() {
    let clock = Arc::new(MockClock::new());
    let cache = VersionedExecutorFactory::<SlidingWindowRateLimiter>::new();
    cache.get_or_create(&policy(1, 1), build(&clock)).expect("valid");
    let broken = RateLimitPolicy::new(PolicyId::new(1, 2), "rl").with_window(SlidingWindow::new(1, 0));
    assert!(cache.get_or_create(&broken, build(&clock)).is_err());
    assert_eq!(cache.get(1).map(|e| e.version()), Some(1));
}

#[test]
fn concurrent_upgrades_converge_on_the_highest_version() {
    let clock = Arc::new(MockClock::new());
    let cache = Arc::new(VersionedExecutorFactory::<SlidingWindowRateLimiter>::new());
    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (1..=16)
        .map(|version| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                barrier.wait();
                let executor = cache
                    .get_or_create(&policy(7, version), build(&clock))
                    .expect("valid policy");
                assert!(executor.version() >= version, "返回的执行器不得旧于请求版本");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }
    assert_eq!(cache.get(7).map(|e| e.version()), Some(16));
    assert_eq!(cache.len(), 1);
}

#[test]
fn retain_drops_removed_policies() {
    let clock = Arc::new(MockClock::new());
    let cache = VersionedExecutorFactory::<SlidingWindowRateLimiter>::new();
    for id in 1..=3 {
        cache.get_or_create(&policy(id, 1), build(&clock)).expect("valid");
    }
    let live: HashSet<i64> = [1, 3].into_iter().collect();
    assert_eq!(cache.retain(&live), 1);
    assert!(cache.get(2).is_none());
    assert!(cache.get(3).is_some());
}
