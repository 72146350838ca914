//! 熔断器：`Closed → Open → HalfOpen → Closed` 状态机。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::{GovernanceError, PolicyError};
use crate::executor::VersionedExecutor;
use crate::observability::targets;
use crate::policy::{CircuitBreakPolicy, SlidingWindowType};
use crate::time::Clock;

/// 熔断器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// 正常放行并统计结果。
    Closed,
    /// 拒绝全部调用，直到等待时长结束。
    Open,
    /// 放行固定数量的试探调用，全部完成后决定关闭或重新打开。
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// 一次被放行调用的凭据。
///
/// 凭据必须交回 [`CircuitBreaker::on_success`]、[`CircuitBreaker::on_error`] 或
/// [`CircuitBreaker::release`] 之一；状态迁移后签发的旧凭据会被静默忽略。
#[must_use = "permit must be handed back to the circuit breaker"]
#[derive(Debug)]
pub struct CircuitPermit {
    generation: u64,
    trial: bool,
}

impl CircuitPermit {
    /// 是否为半开态的试探调用。
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Totals {
    calls: u64,
    failures: u64,
    slow: u64,
}

impl Totals {
    fn add(&mut self, outcome: Outcome) {
        self.calls += 1;
        self.failures += u64::from(outcome.failed);
        self.slow += u64::from(outcome.slow);
    }

    fn remove(&mut self, outcome: Outcome) {
        self.calls = self.calls.saturating_sub(1);
        self.failures = self.failures.saturating_sub(u64::from(outcome.failed));
        self.slow = self.slow.saturating_sub(u64::from(outcome.slow));
    }

    fn rate(part: u64, calls: u64) -> f32 {
        if calls == 0 {
            0.0
        } else {
            part as f32 * 100.0 / calls as f32
        }
    }

    fn exceeds(&self, policy: &CircuitBreakPolicy) -> bool {
        Self::rate(self.failures, self.calls) >= policy.failure_rate()
            || Self::rate(self.slow, self.calls) >= policy.slow_call_rate()
    }
}

/// 滑动窗口：按调用次数的环形队列，或按秒分桶的时间窗口。
#[derive(Debug)]
enum OutcomeWindow {
    Count {
        size: usize,
        outcomes: VecDeque<Outcome>,
        totals: Totals,
    },
    Time {
        seconds: u64,
        origin: Instant,
        buckets: VecDeque<(u64, Totals)>,
    },
}

impl OutcomeWindow {
    fn for_policy(policy: &CircuitBreakPolicy, now: Instant) -> Self {
        let size = policy.window_size();
        match policy.window_type() {
            SlidingWindowType::CountBased => OutcomeWindow::Count {
                size: size as usize,
                outcomes: VecDeque::with_capacity(size.min(1024) as usize),
                totals: Totals::default(),
            },
            SlidingWindowType::TimeBased => OutcomeWindow::Time {
                seconds: u64::from(size),
                origin: now,
                buckets: VecDeque::new(),
            },
        }
    }

    fn record(&mut self, now: Instant, outcome: Outcome) {
        match self {
            OutcomeWindow::Count {
                size,
                outcomes,
                totals,
            } => {
                if outcomes.len() == *size {
                    if let Some(evicted) = outcomes.pop_front() {
                        totals.remove(evicted);
                    }
                }
                outcomes.push_back(outcome);
                totals.add(outcome);
            }
            OutcomeWindow::Time {
                origin, buckets, ..
            } => {
                let second = now.saturating_duration_since(*origin).as_secs();
                match buckets.back_mut() {
                    Some((index, bucket)) if *index == second => bucket.add(outcome),
                    _ => {
                        let mut bucket = Totals::default();
                        bucket.add(outcome);
                        buckets.push_back((second, bucket));
                    }
                }
            }
        }
        self.evict(now);
    }

    fn totals(&mut self, now: Instant) -> Totals {
        self.evict(now);
        match self {
            OutcomeWindow::Count { totals, .. } => *totals,
            OutcomeWindow::Time { buckets, .. } => {
                buckets.iter().fold(Totals::default(), |mut sum, (_, bucket)| {
                    sum.calls += bucket.calls;
                    sum.failures += bucket.failures;
                    sum.slow += bucket.slow;
                    sum
                })
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        if let OutcomeWindow::Time {
            seconds,
            origin,
            buckets,
        } = self
        {
            let current = now.saturating_duration_since(*origin).as_secs();
            while buckets
                .front()
                .is_some_and(|(index, _)| index + *seconds <= current)
            {
                buckets.pop_front();
            }
        }
    }

    fn reset(&mut self) {
        match self {
            OutcomeWindow::Count {
                outcomes, totals, ..
            } => {
                outcomes.clear();
                *totals = Totals::default();
            }
            OutcomeWindow::Time { buckets, .. } => buckets.clear(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    admitted: u32,
    trials: Totals,
}

/// 熔断器。
///
/// # 教案式说明
/// - **意图 (Why)**：下游持续失败或变慢时快速失败，给下游恢复时间，并避免调用方线程被拖住；
/// - **契约 (What)**：
///   - `Closed`：放行并把结果写入滑动窗口；窗口内调用数达到 `effective_min_calls` 且失败率或慢调用率
///     达到阈值时迁移到 `Open`；
///   - `Open`：在 `wait_in_open` 内拒绝全部调用，返回携带降级配置的
///     [`GovernanceError::CircuitBreakerOpen`]；等待结束后的首次 [`CircuitBreaker::acquire`]
///     迁移到 `HalfOpen`；
///   - `HalfOpen`：恰好放行 `permitted_in_half_open` 个试探调用，其余拒绝；试探全部完成后，
///     按同样的阈值判定迁移到 `Open` 或 `Closed`；
///   - 错误码不在策略 `error_codes` 名单内（名单非空时）的失败计为成功；
/// - **实现 (How)**：全部状态由一把自旋锁保护，临界区只做常数级计数；
///   每次状态迁移递增 `generation`，迁移前签发的凭据回报结果时被忽略，不会污染新窗口；
/// - **风险 (Trade-offs)**：`state()` 返回的是最后一次迁移后的状态，`Open` 等待到期后
///   仍显示 `Open`，直到下一次 `acquire` 触发迁移。
pub struct CircuitBreaker {
    policy: CircuitBreakPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakPolicy, clock: Arc<dyn Clock>) -> Result<Self, PolicyError> {
        policy.validate()?;
        let window = OutcomeWindow::for_policy(&policy, clock.now());
        Ok(Self {
            policy,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                window,
                opened_at: None,
                admitted: 0,
                trials: Totals::default(),
            }),
        })
    }

    pub fn policy(&self) -> &CircuitBreakPolicy {
        &self.policy
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// 请求放行一次调用。
    pub fn acquire(&self) -> Result<CircuitPermit, GovernanceError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let reopen_at = inner
                .opened_at
                .map(|opened| opened + self.policy.wait_in_open());
            if reopen_at.is_some_and(|at| now >= at) {
                self.transition(&mut inner, CircuitState::HalfOpen, now);
            }
        }
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(CircuitPermit {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::HalfOpen if inner.admitted < self.policy.permitted_in_half_open() => {
                inner.admitted += 1;
                Ok(CircuitPermit {
                    generation: inner.generation,
                    trial: true,
                })
            }
            _ => {
                drop(inner);
                tracing::debug!(
                    target: targets::CIRCUIT,
                    { policy.id = self.policy.policy_id.id,
                    state = state.as_str() },
                    "circuit breaker rejected call"
                );
                Err(GovernanceError::CircuitBreakerOpen {
                    policy_id: self.policy.policy_id.id,
                    degrade: self.policy.degrade_config.clone(),
                })
            }
        }
    }

    /// 回报一次成功调用及其耗时。
    pub fn on_success(&self, permit: CircuitPermit, duration: Duration) {
        self.record(
            permit,
            Outcome {
                failed: false,
                slow: duration >= self.policy.slow_call_duration(),
            },
        );
    }

    /// 回报一次失败调用；`code` 用于按 `error_codes` 过滤。
    pub fn on_error(&self, permit: CircuitPermit, duration: Duration, code: Option<&str>) {
        self.record(
            permit,
            Outcome {
                failed: self.policy.counts_as_failure(code),
                slow: duration >= self.policy.slow_call_duration(),
            },
        );
    }

    /// 交回未执行的调用凭据（例如后续限流拒绝），半开态会归还试探名额。
    pub fn release(&self, permit: CircuitPermit) {
        let mut inner = self.inner.lock();
        if permit.trial
            && permit.generation == inner.generation
            && inner.state == CircuitState::HalfOpen
        {
            inner.admitted = inner.admitted.saturating_sub(1);
        }
    }

    fn record(&self, permit: CircuitPermit, outcome: Outcome) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if permit.generation != inner.generation {
            return;
        }
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.window.record(now, outcome);
                let totals = inner.window.totals(now);
                if totals.calls > 0
                    && totals.calls >= u64::from(self.policy.effective_min_calls())
                    && totals.exceeds(&self.policy)
                {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.trials.add(outcome);
                if inner.trials.calls >= u64::from(self.policy.permitted_in_half_open()) {
                    let next = if inner.trials.exceeds(&self.policy) {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(&mut inner, next, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitState, now: Instant) {
        let previous = inner.state;
        inner.state = next;
        inner.generation += 1;
        inner.admitted = 0;
        inner.trials = Totals::default();
        match next {
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.reset();
            }
            CircuitState::HalfOpen => {}
        }
        tracing::info!(
            target: targets::CIRCUIT,
            { policy.id = self.policy.policy_id.id,
            policy.version = self.policy.policy_id.version,
            from = previous.as_str(),
            to = next.as_str() },
            "circuit breaker state changed"
        );
    }
}

impl VersionedExecutor for CircuitBreaker {
    fn version(&self) -> i64 {
        self.policy.policy_id.version
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy.policy_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
