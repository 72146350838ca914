//! 故障注入：按百分比抽样的延迟或错误。

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::{Either, select};
use rand::Rng;

use crate::contract::CallContext;
use crate::error::GovernanceError;
use crate::matcher::TagMatcherRegistry;
use crate::observability::targets;
use crate::policy::{FaultInjectionPolicy, FaultKind};
use crate::request::Request;
use crate::time::Clock;

const STAGE: &str = "applying an injected delay";

/// `[0, 100)` 上的均匀抽样来源。
pub trait RandomSource: Send + Sync {
    fn next_percent(&self) -> u32;
}

/// 线程本地随机数发生器。
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_percent(&self) -> u32 {
        rand::thread_rng().gen_range(0..100)
    }
}

/// 固定取值的抽样来源，测试用于复现命中与未命中。
#[derive(Debug, Default)]
pub struct FixedRandom(AtomicU32);

impl FixedRandom {
    pub fn new(value: u32) -> Self {
        Self(AtomicU32::new(value.min(99)))
    }

    pub fn set(&self, value: u32) {
        self.0.store(value.min(99), Ordering::Relaxed);
    }
}

impl RandomSource for FixedRandom {
    fn next_percent(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// 一次故障注入求值的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultOutcome {
    /// 命中并执行完毕的延迟总时长。
    pub delayed: Duration,
    /// 命中的策略数（含延迟与错误）。
    pub injected: usize,
}

/// 故障注入器。
///
/// # 教案式说明
/// - **意图 (Why)**：在生产流量上演练下游变慢或报错时的整体表现；
/// - **契约 (What)**：
///   - 按顺序求值每条策略：条件不命中或抽样未命中则跳过；
///   - `percent <= 0` 从不注入，`percent >= 100` 总是注入，其余在 `[0, 100)` 均匀抽样，
///     小于 `percent` 时注入；
///   - 延迟故障经由时钟挂起，可被取消打断；若截止时间早于延迟结束，挂起到截止后返回
///     [`GovernanceError::DeadlineExceeded`]；多个延迟依次累加；
///   - 错误故障立即返回 [`GovernanceError::FaultInjected`]，后续策略不再求值；
/// - **风险 (Trade-offs)**：注入器本身无状态，不进入执行器缓存，抽样来源在引擎级共享。
pub struct FaultInjector {
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
}

impl FaultInjector {
    pub fn new(random: Arc<dyn RandomSource>, clock: Arc<dyn Clock>) -> Self {
        Self { random, clock }
    }

    /// 按百分比抽样。
    pub fn should_inject(&self, percent: i32) -> bool {
        if percent <= 0 {
            return false;
        }
        if percent >= 100 {
            return true;
        }
        i64::from(self.random.next_percent()) < i64::from(percent)
    }

    /// 对一组策略求值并执行命中的故障。
    pub async fn inject(
        &self,
        policies: &[FaultInjectionPolicy],
        matcher: &TagMatcherRegistry,
        request: &dyn Request,
        call: &CallContext,
    ) -> Result<FaultOutcome, GovernanceError> {
        let mut outcome = FaultOutcome::default();
        for policy in policies {
            if !matcher.matches_all(&policy.conditions, policy.relation, request) {
                continue;
            }
            if !self.should_inject(policy.effective_percent()) {
                continue;
            }
            outcome.injected += 1;
            match &policy.kind {
                FaultKind::Delay { delay_time_ms } => {
                    let delay = Duration::from_millis(*delay_time_ms);
                    tracing::debug!(
                        target: targets::FAULT,
                        { policy.id = policy.policy_id.id,
                        delay_ms = *delay_time_ms },
                        "injecting delay"
                    );
                    self.delay(delay, call).await?;
                    outcome.delayed += delay;
                }
                FaultKind::Error {
                    error_code,
                    error_msg,
                } => {
                    tracing::debug!(
                        target: targets::FAULT,
                        { policy.id = policy.policy_id.id,
                        error_code = *error_code },
                        "injecting error"
                    );
                    return Err(GovernanceError::FaultInjected {
                        policy_id: policy.policy_id.id,
                        code: *error_code,
                        message: error_msg.clone(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn delay(&self, delay: Duration, call: &CallContext) -> Result<(), GovernanceError> {
        if call.cancellation().is_cancelled() {
            return Err(GovernanceError::Cancelled { stage: STAGE });
        }
        let remaining = call.deadline().remaining(self.clock.now());
        let deadline_bound = remaining.is_some_and(|remaining| remaining < delay);
        let wait = remaining.map_or(delay, |remaining| remaining.min(delay));
        let cancelled = pin!(call.cancellation().cancelled());
        match select(self.clock.sleep(wait), cancelled).await {
            Either::Left(_) if deadline_bound => Err(GovernanceError::DeadlineExceeded { stage: STAGE }),
            Either::Left(_) => Ok(()),
            Either::Right(_) => Err(GovernanceError::Cancelled { stage: STAGE }),
        }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector").finish_non_exhaustive()
    }
}
