//! 快照发布：版本单调的原子替换。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::{ArcSwapOption, Guard};
use spin::RwLock;

use super::snapshot::GovernancePolicy;
use crate::observability::targets;

/// 控制面推送的一次快照更新。
#[derive(Clone, Debug)]
pub struct PolicyEvent {
    policy: GovernancePolicy,
    source: Option<String>,
}

impl PolicyEvent {
    pub fn new(policy: GovernancePolicy) -> Self {
        Self {
            policy,
            source: None,
        }
    }

    /// 标注更新来源（如控制面地址或文件路径），仅用于日志。
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn version(&self) -> i64 {
        self.policy.version
    }
}

/// 快照发布结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 新快照已生效；`previous` 为被替换的版本（首次发布为 `None`）。
    Applied { previous: Option<i64>, version: i64 },
    /// 新快照版本不高于当前版本，被丢弃。
    Stale { current: i64, offered: i64 },
}

impl PublishOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PublishOutcome::Applied { .. })
    }
}

/// 策略订阅入口，由控制面客户端调用。
pub trait PolicyListener: Send + Sync {
    fn on_update(&self, event: PolicyEvent) -> PublishOutcome;
}

/// 新快照生效后的回调，用于清理执行器缓存等衍生状态。
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<GovernancePolicy>);
}

/// 快照发布者。
///
/// # 教案式说明
/// - **意图 (Why)**：控制面推送可能乱序或并发到达，决策路径却必须永远看到单调前进的版本；
/// - **契约 (What)**：
///   - [`PolicySupervisor::snapshot`] 无锁读取当前快照，首次发布前为 `None`（全部放行）；
///   - [`PolicySupervisor::publish`] 先在锁外完成快照构建，再以 CAS 循环替换，
///     仅当新版本严格大于当前版本时生效；
///   - `epoch` 在每次成功替换后加一，便于观测配置是否生效；
/// - **实现 (How)**：与运行时超时配置相同的“`ArcSwap` + 纪元计数”组合，写入常数时间、读取无锁；
///   观察者列表变动极少，使用自旋读写锁保护。
pub struct PolicySupervisor {
    current: ArcSwapOption<GovernancePolicy>,
    epoch: AtomicU64,
    observers: RwLock<Vec<Arc<dyn SnapshotObserver>>>,
}

impl PolicySupervisor {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            epoch: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<GovernancePolicy>> {
        self.current.load_full()
    }

    pub fn version(&self) -> Option<i64> {
        self.current.load_full().map(|snapshot| snapshot.version)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, observer: Arc<dyn SnapshotObserver>) {
        self.observers.write().push(observer);
    }

    /// 构建并发布快照。
    pub fn publish(&self, policy: GovernancePolicy) -> PublishOutcome {
        let offered = policy.version;
        if let Some(current) = self.version().filter(|current| offered <= *current) {
            return self.reject(current, offered);
        }

        let next = policy.build();
        let mut current = self.current.load_full();
        loop {
            if let Some(existing) = current.as_ref().filter(|c| offered <= c.version) {
                return self.reject(existing.version, offered);
            }
            let previous = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&next)));
            let previous = Guard::into_inner(previous);
            if same(&previous, &current) {
                break;
            }
            current = previous;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = current.as_ref().map(|snapshot| snapshot.version);
        tracing::info!(
            target: targets::POLICY,
            { snapshot.version = offered,
            previous = ?previous,
            epoch },
            "governance snapshot published"
        );
        // 并发发布时通知可能交错，观察者总是拿到当前最新的快照。
        let latest = self.snapshot().unwrap_or(next);
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.on_snapshot(&latest);
        }
        PublishOutcome::Applied {
            previous,
            version: offered,
        }
    }

    fn reject(&self, current: i64, offered: i64) -> PublishOutcome {
        tracing::debug!(
            target: targets::POLICY,
            current,
            offered,
            "ignoring governance snapshot that does not advance the version"
        );
        PublishOutcome::Stale { current, offered }
    }
}

impl Default for PolicySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySupervisor")
            .field("version", &self.version())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

impl PolicyListener for PolicySupervisor {
    fn on_update(&self, event: PolicyEvent) -> PublishOutcome {
        if let Some(source) = &event.source {
            tracing::debug!(
                target: targets::POLICY,
                source = %source,
                offered = event.version(),
                "received governance snapshot"
            );
        }
        self.publish(event.policy)
    }
}

fn same(a: &Option<Arc<GovernancePolicy>>, b: &Option<Arc<GovernancePolicy>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
