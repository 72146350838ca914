//! 可注入时钟。
//!
//! 熔断等待、滑动窗口、隔离舱排队与故障延迟全部依赖时间；统一经由 [`Clock`] 取时与睡眠，
//! 生产环境使用 [`SystemClock`]，测试注入 [`MockClock`] 手动推进虚拟时间。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use spin::Mutex;

/// 时钟接口返回的统一延迟 Future。
///
/// # 设计意图（Why）
/// - 以 `Pin<Box<dyn Future>>` 表达睡眠原语，避免具体运行时类型渗透到治理 API；
/// - 统一形态便于测试替换，同时保持对象安全。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 抽象可注入的时钟。
///
/// # 接口约束（What）
/// - `now`：返回单调时间点，实现者必须保证单调不减；
/// - `sleep`：返回在给定持续时间后完成的 Future，完成前至少等待该持续时间。
///
/// # 使用指引（How）
/// - 以 `Arc<dyn Clock>` 传递给熔断器、限流器、隔离舱与重试器；
/// - 测试注入 [`MockClock`] 并调用 [`MockClock::advance`]。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回一个在指定持续时间后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 基于 Tokio 时间驱动的系统时钟。
///
/// `sleep` 返回的 Future 需在启用了时间驱动的 Tokio 运行时中轮询。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 虚拟时钟：通过手动推进时间复现确定性的唤醒序列。
///
/// # 行为概览（How）
/// - 内部维护自构造起的偏移量 `elapsed` 与待触发的睡眠列表；
/// - [`MockClock::advance`] 增加偏移量并唤醒所有到期的睡眠；
/// - 睡眠 Future 的到期判定与 waker 登记在同一把锁内完成，推进与轮询交错时不会丢失唤醒。
///
/// # 契约说明（What）
/// - 偏移量单调增加；
/// - 被提前 Drop 的睡眠会从调度队列中移除。
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<Mutex<ClockState>>,
}

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<SleepState>>,
    next_id: u64,
}

#[derive(Debug)]
struct SleepState {
    id: u64,
    deadline: Duration,
    waker: Mutex<Option<Waker>>,
    completed: AtomicBool,
}

impl MockClock {
    /// 以当前系统时间为基准创建虚拟时钟。
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起始时间构造虚拟时钟。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockState {
                origin,
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// 推进虚拟时间并唤醒到期睡眠，唤醒顺序与登记顺序一致。
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }
        let mut to_wake = Vec::new();
        {
            let mut state = self.inner.lock();
            state.elapsed = state.elapsed.saturating_add(delta);
            let elapsed = state.elapsed;
            state.sleepers.retain(|entry| {
                if elapsed >= entry.deadline {
                    entry.completed.store(true, Ordering::SeqCst);
                    if let Some(waker) = entry.waker.lock().take() {
                        to_wake.push(waker);
                    }
                    false
                } else {
                    true
                }
            });
        }
        for waker in to_wake {
            waker.wake();
        }
    }

    /// 自起始时间以来累计的虚拟偏移。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }

    /// 当前仍在等待的睡眠数量，测试据此确认调用已进入等待。
    pub fn pending_sleepers(&self) -> usize {
        self.inner.lock().sleepers.len()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut state = self.inner.lock();
        let sleep = Arc::new(SleepState {
            id: state.next_id,
            deadline: state.elapsed.saturating_add(duration),
            waker: Mutex::new(None),
            completed: AtomicBool::new(duration.is_zero()),
        });
        state.next_id += 1;
        if !duration.is_zero() {
            state.sleepers.push(Arc::clone(&sleep));
        }
        Box::pin(MockSleep {
            clock: Arc::clone(&self.inner),
            state: sleep,
        })
    }
}

struct MockSleep {
    clock: Arc<Mutex<ClockState>>,
    state: Arc<SleepState>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.completed.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        let clock = self.clock.lock();
        if clock.elapsed >= self.state.deadline {
            self.state.completed.store(true, Ordering::SeqCst);
            return Poll::Ready(());
        }
        let mut slot = self.state.waker.lock();
        if !slot.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
            *slot = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        if !self.state.completed.load(Ordering::SeqCst) {
            let id = self.state.id;
            self.clock.lock().sleepers.retain(|entry| entry.id != id);
        }
    }
}
