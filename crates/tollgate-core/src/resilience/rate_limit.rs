//! 多窗口“与”组合的滑动窗口限流器。

use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::{GovernanceError, PolicyError};
use crate::executor::VersionedExecutor;
use crate::observability::targets;
use crate::policy::{RateLimitPolicy, SlidingWindow};
use crate::time::Clock;

#[derive(Debug)]
struct WindowCounter {
    window: SlidingWindow,
    span: Duration,
    started: Option<Instant>,
    used: u64,
}

impl WindowCounter {
    fn new(window: SlidingWindow) -> Self {
        Self {
            window,
            span: window.span(),
            started: None,
            used: 0,
        }
    }

    /// 周期以首次请求为起点对齐；跨越一个或多个周期时计数归零。
    fn roll(&mut self, now: Instant) {
        let Some(started) = self.started else {
            self.started = Some(now);
            self.used = 0;
            return;
        };
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.span {
            return;
        }
        let into_period = elapsed.as_nanos() % self.span.as_nanos().max(1);
        let into_period = Duration::from_nanos(u64::try_from(into_period).unwrap_or(0));
        self.started = Some(now - into_period);
        self.used = 0;
    }

    fn remaining(&self) -> u64 {
        self.window.threshold.saturating_sub(self.used)
    }
}

/// 滑动窗口限流器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 策略中的多个窗口是“与”关系，例如“每秒 10 次且每分钟 100 次”；任一窗口额度耗尽即拒绝；
///   - 放行判定先检查全部窗口、再统一扣减，整个过程在同一把锁内完成，
///     被拒绝的调用不会消耗任何窗口的额度；
///   - `threshold == 0` 的窗口拒绝全部调用；没有窗口的策略放行全部调用；
/// - **实现 (How)**：每个窗口是以首次请求为起点的固定周期计数器，周期边界处计数归零。
/// - **风险 (Trade-offs)**：固定周期在边界两侧可能出现短时两倍突发，换取常数级的内存与判定开销。
pub struct SlidingWindowRateLimiter {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    counters: Mutex<Vec<WindowCounter>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Result<Self, PolicyError> {
        policy.validate()?;
        let counters = policy
            .sliding_windows
            .iter()
            .copied()
            .map(WindowCounter::new)
            .collect();
        Ok(Self {
            policy,
            clock,
            counters: Mutex::new(counters),
        })
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// 尝试占用一次额度，不会挂起。
    pub fn try_acquire(&self) -> Result<(), GovernanceError> {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        for counter in counters.iter_mut() {
            counter.roll(now);
        }
        let exhausted = counters
            .iter()
            .find(|counter| counter.remaining() == 0)
            .map(|counter| counter.window);
        if let Some(window) = exhausted {
            drop(counters);
            tracing::debug!(
                target: targets::LIMIT,
                { policy.id = self.policy.policy_id.id,
                threshold = window.threshold,
                window_ms = window.time_window_ms },
                "rate limit exceeded"
            );
            return Err(GovernanceError::RateLimited {
                policy_id: self.policy.policy_id.id,
                threshold: window.threshold,
                window_ms: window.time_window_ms,
            });
        }
        for counter in counters.iter_mut() {
            counter.used += 1;
        }
        Ok(())
    }

    /// 所有窗口中剩余额度的最小值；没有窗口时返回 `None`（不限流）。
    pub fn available(&self) -> Option<u64> {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        counters
            .iter_mut()
            .map(|counter| {
                counter.roll(now);
                counter.remaining()
            })
            .min()
    }
}

impl VersionedExecutor for SlidingWindowRateLimiter {
    fn version(&self) -> i64 {
        self.policy.policy_id.version
    }
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("policy", &self.policy.policy_id)
            .field("windows", &self.policy.sliding_windows)
            .finish_non_exhaustive()
    }
}
