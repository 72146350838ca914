//! 重试器：按失败重试策略重放调用。

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::future::{Either, select};

use crate::contract::{CallContext, Idempotency};
use crate::error::PolicyError;
use crate::executor::VersionedExecutor;
use crate::observability::targets;
use crate::policy::FailoverPolicy;
use crate::time::Clock;

/// 重试停止的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryStop {
    /// 结果不具备重试资格，或调用不允许重放（单次尝试同样归入此类）。
    NotRetryable,
    /// 已用尽全部尝试次数，最后一次结果仍要求重试。
    Exhausted,
    /// 退避等待中被取消。
    Cancelled,
    /// 剩余时间不足以完成下一次退避。
    DeadlineExceeded,
}

/// 重试最终失败时的结果：最后一次错误原样保留，附带尝试次数与停止原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub stop: RetryStop,
    pub error: E,
}

impl<E> RetryFailure<E> {
    pub fn into_inner(self) -> E {
        self.error
    }

    pub fn is_exhausted(&self) -> bool {
        self.stop == RetryStop::Exhausted
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} after {} attempt(s) ({:?})", self.error, self.attempts, self.stop)
    }
}

impl<E> std::error::Error for RetryFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 重试器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 总尝试次数不超过 `retry_attempts`（含首次）；
///   - `should_retry` 同时审视成功与失败结果，成功结果也可要求重试（例如业务码表示繁忙）；
///     最后一次尝试的结果无论如何都原样返回；
///   - 调用方声明 [`Idempotency::NonIdempotent`] 时从不重试；策略 `require_idempotent`
///     为真时，只有声明 [`Idempotency::Idempotent`] 的调用才会重试；
///   - 两次尝试之间按策略退避，退避经由时钟挂起，可被取消打断；剩余时间不足一次退避时直接停止；
/// - **实现 (How)**：`operation` 接收从 1 开始的尝试序号，每次尝试都构造新的 Future。
pub struct Retrier {
    policy: FailoverPolicy,
    clock: Arc<dyn Clock>,
}

impl Retrier {
    pub fn new(policy: FailoverPolicy, clock: Arc<dyn Clock>) -> Result<Self, PolicyError> {
        if let Some(0) = policy.retry_attempts {
            return Err(PolicyError::invalid(policy.policy_id.id, "retry_attempts", "must be > 0"));
        }
        Ok(Self { policy, clock })
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    /// 给定幂等声明时允许的最大尝试次数。
    pub fn max_attempts(&self, idempotency: Idempotency) -> u32 {
        let replayable = match idempotency {
            Idempotency::NonIdempotent => false,
            Idempotency::Idempotent => true,
            Idempotency::Unknown => !self.policy.requires_idempotent(),
        };
        if replayable { self.policy.attempts() } else { 1 }
    }

    pub async fn execute<T, E, F, Fut, P>(
        &self,
        call: &CallContext,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&Result<T, E>) -> bool,
    {
        let max = self.max_attempts(call.idempotency());
        let mut attempt = 1;
        loop {
            let outcome = operation(attempt).await;
            let wants_retry = should_retry(&outcome);
            if !wants_retry {
                return finish(outcome, attempt, RetryStop::NotRetryable);
            }
            if attempt >= max {
                let stop = if max > 1 { RetryStop::Exhausted } else { RetryStop::NotRetryable };
                if stop == RetryStop::Exhausted {
                    tracing::debug!(
                        target: targets::RETRY,
                        { policy.id = self.policy.policy_id.id,
                        retry.attempt = attempt },
                        "retry attempts exhausted"
                    );
                }
                return finish(outcome, attempt, stop);
            }

            let delay = self.policy.delay_for_retry(attempt);
            let remaining = call.deadline().remaining(self.clock.now());
            if remaining.is_some_and(|remaining| remaining <= delay) {
                return finish(outcome, attempt, RetryStop::DeadlineExceeded);
            }
            if call.cancellation().is_cancelled() {
                return finish(outcome, attempt, RetryStop::Cancelled);
            }
            tracing::debug!(
                target: targets::RETRY,
                { policy.id = self.policy.policy_id.id,
                retry.attempt = attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) },
                "retrying call"
            );
            if !delay.is_zero() {
                let cancelled = pin!(call.cancellation().cancelled());
                if let Either::Right(_) = select(self.clock.sleep(delay), cancelled).await {
                    return finish(outcome, attempt, RetryStop::Cancelled);
                }
            }
            attempt += 1;
        }
    }
}

fn finish<T, E>(outcome: Result<T, E>, attempts: u32, stop: RetryStop) -> Result<T, RetryFailure<E>> {
    outcome.map_err(|error| RetryFailure {
        attempts,
        stop,
        error,
    })
}

impl VersionedExecutor for Retrier {
    fn version(&self) -> i64 {
        self.policy.policy_id.version
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy.policy_id)
            .field("attempts", &self.policy.attempts())
            .finish_non_exhaustive()
    }
}
