//! 并发隔离舱（bulkhead）。

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{Either, select};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::contract::CallContext;
use crate::error::{GovernanceError, PolicyError};
use crate::executor::VersionedExecutor;
use crate::observability::targets;
use crate::policy::ConcurrencyLimitPolicy;
use crate::time::Clock;

const STAGE: &str = "waiting for a concurrency permit";

/// 占用中的并发槽位，Drop 时归还。
#[must_use = "dropping the permit releases the slot immediately"]
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

/// 基于信号量的并发限制器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 同时在途的调用数不超过 `max_concurrency`；
///   - [`ConcurrencyLimiter::acquire`] 有空闲槽位时立即返回；否则最多排队 `max_wait`，
///     并受调用方截止时间进一步收紧；排队中被取消返回 [`GovernanceError::Cancelled`]；
///   - 等待上限由截止时间决定且先到期时返回 [`GovernanceError::DeadlineExceeded`]，
///     否则返回 [`GovernanceError::ConcurrencyLimited`]；
/// - **实现 (How)**：`tokio::sync::Semaphore` 按 FIFO 分配槽位，排队与计时、取消三者竞速，
///   先完成者决定结果，其余 Future 随之 Drop，排队登记被撤销。
pub struct ConcurrencyLimiter {
    policy: ConcurrencyLimitPolicy,
    max: u32,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl ConcurrencyLimiter {
    pub fn new(policy: ConcurrencyLimitPolicy, clock: Arc<dyn Clock>) -> Result<Self, PolicyError> {
        policy.validate()?;
        let max = policy.max_concurrency.unwrap_or(1);
        Ok(Self {
            policy,
            max,
            semaphore: Arc::new(Semaphore::new(max as usize)),
            clock,
        })
    }

    pub fn policy(&self) -> &ConcurrencyLimitPolicy {
        &self.policy
    }

    /// 当前在途调用数。
    pub fn in_flight(&self) -> u32 {
        let available = u32::try_from(self.semaphore.available_permits()).unwrap_or(self.max);
        self.max.saturating_sub(available)
    }

    /// 不排队的获取。
    pub fn try_acquire(&self) -> Result<ConcurrencyPermit, GovernanceError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(ConcurrencyPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(self.rejected()),
            Err(TryAcquireError::Closed) => Err(closed()),
        }
    }

    /// 获取槽位，必要时在等待上限内排队。
    pub async fn acquire(&self, call: &CallContext) -> Result<ConcurrencyPermit, GovernanceError> {
        if call.cancellation().is_cancelled() {
            return Err(GovernanceError::Cancelled { stage: STAGE });
        }
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(ConcurrencyPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {}
            Err(TryAcquireError::Closed) => return Err(closed()),
        }

        let max_wait = self.policy.max_wait();
        let remaining = call.deadline().remaining(self.clock.now());
        if remaining == Some(Duration::ZERO) {
            return Err(GovernanceError::DeadlineExceeded { stage: STAGE });
        }
        if max_wait.is_zero() {
            return Err(self.rejected());
        }
        let deadline_bound = remaining.is_some_and(|remaining| remaining < max_wait);
        let wait = remaining.map_or(max_wait, |remaining| remaining.min(max_wait));

        let acquire = pin!(Arc::clone(&self.semaphore).acquire_owned());
        let cancelled = pin!(call.cancellation().cancelled());
        let timer = self.clock.sleep(wait);
        match select(acquire, select(timer, cancelled)).await {
            Either::Left((Ok(permit), _)) => Ok(ConcurrencyPermit { _permit: permit }),
            Either::Left((Err(_), _)) => Err(closed()),
            Either::Right((Either::Left(_), _)) if deadline_bound => {
                Err(GovernanceError::DeadlineExceeded { stage: STAGE })
            }
            Either::Right((Either::Left(_), _)) => Err(self.rejected()),
            Either::Right((Either::Right(_), _)) => Err(GovernanceError::Cancelled { stage: STAGE }),
        }
    }

    fn rejected(&self) -> GovernanceError {
        tracing::debug!(
            target: targets::LIMIT,
            { policy.id = self.policy.policy_id.id,
            max_concurrency = self.max },
            "concurrency limit reached"
        );
        GovernanceError::ConcurrencyLimited {
            policy_id: self.policy.policy_id.id,
            max_concurrency: self.max,
        }
    }
}

fn closed() -> GovernanceError {
    GovernanceError::internal("concurrency semaphore closed")
}

impl VersionedExecutor for ConcurrencyLimiter {
    fn version(&self) -> i64 {
        self.policy.policy_id.version
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("policy", &self.policy.policy_id)
            .field("max", &self.max)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Cancellation, Deadline};
    use crate::policy::PolicyId;
    use crate::time::MockClock;
    use futures::FutureExt;

    fn limiter(max: u32, wait_ms: u64, clock: Arc<MockClock>) -> ConcurrencyLimiter {
        let policy = ConcurrencyLimitPolicy::new(PolicyId::new(1, 1), "bulkhead", max)
            .with_max_wait(Duration::from_millis(wait_ms));
        ConcurrencyLimiter::new(policy, clock).expect("valid policy")
    }

    #[test]
    fn permits_are_returned_on_drop() {
        let limiter = limiter(1, 0, Arc::new(MockClock::new()));
        let permit = limiter.try_acquire().expect("free slot");
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_err());
        drop(permit);
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn waiter_times_out_after_max_wait() {
        let clock = Arc::new(MockClock::new());
        let limiter = limiter(1, 50, clock.clone());
        let _held = limiter.try_acquire().expect("free slot");
        let call = CallContext::default();
        let mut waiting = Box::pin(limiter.acquire(&call));
        assert!(waiting.as_mut().now_or_never().is_none(), "满载时应进入排队");
        clock.advance(Duration::from_millis(50));
        let err = waiting.now_or_never().expect("timer fired").expect_err("timed out");
        assert!(matches!(err, GovernanceError::ConcurrencyLimited { max_concurrency: 1, .. }));
    }

    #[test]
    fn waiter_receives_released_slot() {
        let clock = Arc::new(MockClock::new());
        let limiter = limiter(1, 1_000, clock.clone());
        let held = limiter.try_acquire().expect("free slot");
        let call = CallContext::default();
        let mut waiting = Box::pin(limiter.acquire(&call));
        assert!(waiting.as_mut().now_or_never().is_none());
        drop(held);
        assert!(waiting.now_or_never().expect("slot handed over").is_ok());
    }

    #[test]
    fn deadline_shorter_than_wait_is_reported() {
        let clock = Arc::new(MockClock::new());
        let limiter = limiter(1, 1_000, clock.clone());
        let _held = limiter.try_acquire().expect("free slot");
        let call = CallContext::builder()
            .deadline(Deadline::with_timeout(clock.now(), Duration::from_millis(20)))
            .build();
        let mut waiting = Box::pin(limiter.acquire(&call));
        assert!(waiting.as_mut().now_or_never().is_none());
        clock.advance(Duration::from_millis(20));
        let err = waiting.now_or_never().expect("timer fired").expect_err("deadline");
        assert!(matches!(err, GovernanceError::DeadlineExceeded { .. }));
    }

    #[test]
    fn cancellation_aborts_the_wait() {
        let clock = Arc::new(MockClock::new());
        let limiter = limiter(1, 1_000, clock.clone());
        let _held = limiter.try_acquire().expect("free slot");
        let token = Cancellation::new();
        let call = CallContext::builder().cancellation(token.clone()).build();
        let mut waiting = Box::pin(limiter.acquire(&call));
        assert!(waiting.as_mut().now_or_never().is_none());
        token.cancel();
        let err = waiting.now_or_never().expect("cancel observed").expect_err("cancelled");
        assert!(matches!(err, GovernanceError::Cancelled { .. }));
        assert_eq!(clock.pending_sleepers(), 0, "排队计时器必须随之撤销");
    }
}
