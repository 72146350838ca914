//! 调用契约：取消、截止与幂等标记。
//!
//! # 设计背景（Why）
//! - 隔离舱排队、故障延迟与重试退避都可能等待；等待必须能被调用方取消或截止时间打断；
//! - 把这些约束集中到 [`CallContext`]，治理组件只依赖这一份只读视图。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// 协作式取消令牌。
///
/// # 契约说明（What）
/// - 克隆与 [`Cancellation::child`] 共享同一原子位，任一持有者取消后全体可见；
/// - [`Cancellation::cancelled`] 返回在取消发生时完成的 Future，供等待路径竞速使用；
/// - 取消不可撤销。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者。
    ///
    /// 返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待取消发生。
    ///
    /// `Notified` 在检查标志位之前创建，`notify_waiters` 对已创建的 `Notified` 必然可见，
    /// 因而“先取消后等待”与“先等待后取消”两种交错都会完成。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 截止时间，可为空（调用方未施加硬超时）。
///
/// 截止时间不会自动驱动取消；治理组件在等待前以 [`Deadline::remaining`] 收紧等待上限。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 基于当前时间点加持续时间生成截止时间。
    pub fn with_timeout(now: Instant, timeout: Duration) -> Self {
        Self::at(now + timeout)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.instant.is_some_and(|deadline| now >= deadline)
    }

    /// 距截止的剩余时长；未设置截止返回 `None`，已过期返回零。
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// 调用方声明的幂等性。
///
/// 重试器只在调用“可安全重放”时才会发起第二次尝试，详见 [`crate::resilience::Retrier`]。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Idempotency {
    /// 调用方未声明。
    #[default]
    Unknown,
    Idempotent,
    NonIdempotent,
}

/// 治理决策所需的调用上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把取消、截止与幂等性打包成一次调用内不可变的视图，
///   让熔断、隔离舱、故障延迟与重试共享同一份约束；
/// - **契约 (What)**：克隆廉价，取消令牌在克隆间共享；
/// - **使用 (How)**：通过 [`CallContext::builder`] 构造，未设置的字段取默认值
///   （不取消、无截止、幂等性未知）。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
    idempotency: Idempotency,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn idempotency(&self) -> Idempotency {
        self.idempotency
    }
}

/// [`CallContext`] 构建器。
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    cancellation: Option<Cancellation>,
    deadline: Deadline,
    idempotency: Idempotency,
}

impl CallContextBuilder {
    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn build(self) -> CallContext {
        CallContext {
            cancellation: self.cancellation.unwrap_or_default(),
            deadline: self.deadline,
            idempotency: self.idempotency,
        }
    }
}
