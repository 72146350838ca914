//! # executor 模块说明
//!
//! ## 角色定位（Why）
//! - 熔断器、限流器、隔离舱与重试器都是“由策略构造、带运行时状态”的执行器；
//!   同一策略 id 的执行器必须在调用间复用，策略升级时又必须换成新版本；
//!
//! ## 契约（What）
//! - 缓存以策略 id 为键，每个键对应一个可原子替换的单元格；
//! - 读路径不加锁；缓存中的版本只增不减，较旧的策略永远不会覆盖较新的执行器；
//! - 快照切换后可用 [`VersionedExecutorFactory::retain`] 清理已消失的策略 id。
//!
//! ## 实现（How）
//! 1. 取出（或创建）键对应的单元格；
//! 2. 读取当前执行器；
//! 3. 若当前版本不低于策略版本，直接返回当前执行器；
//! 4. 否则构造新执行器；
//! 5. 以比较交换写入；失败说明有并发写者，重新读取后回到第 3 步。
//!
//! ## 风险（Trade-offs）
//! - 并发升级时可能构造出多个新执行器，只有一个胜出，其余被丢弃；构造是纯内存操作，可接受。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::{ArcSwapOption, Guard};
use dashmap::DashMap;

use crate::error::PolicyError;
use crate::observability::targets;
use crate::policy::PolicyIdentified;

/// 带版本的执行器。
pub trait VersionedExecutor: Send + Sync + 'static {
    /// 构造该执行器所用策略的版本。
    fn version(&self) -> i64;
}

type Cell<E> = Arc<ArcSwapOption<E>>;

/// 以策略 id 为键、版本单调的执行器缓存。
pub struct VersionedExecutorFactory<E> {
    cells: DashMap<i64, Cell<E>>,
    builds: AtomicU64,
}

impl<E: VersionedExecutor> VersionedExecutorFactory<E> {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            builds: AtomicU64::new(0),
        }
    }

    /// 获取与策略版本匹配（或更新）的执行器，必要时调用 `build` 构造。
    ///
    /// `build` 失败时缓存保持不变，错误原样返回，调用方应按内部错误放行。
    pub fn get_or_create<P, F>(&self, policy: &P, build: F) -> Result<Arc<E>, PolicyError>
    where
        P: PolicyIdentified + ?Sized,
        F: FnOnce(&P) -> Result<E, PolicyError>,
    {
        let id = policy.policy_id();
        let cell = self.cell(id.id);
        let mut current = cell.load_full();
        if let Some(existing) = current.as_ref().filter(|e| e.version() >= id.version) {
            return Ok(Arc::clone(existing));
        }

        let next = Arc::new(build(policy)?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        loop {
            if let Some(existing) = current.as_ref().filter(|e| e.version() >= id.version) {
                return Ok(Arc::clone(existing));
            }
            let previous = Guard::into_inner(cell.compare_and_swap(&current, Some(Arc::clone(&next))));
            if same(&previous, &current) {
                tracing::debug!(
                    target: targets::POLICY,
                    { policy.id = id.id,
                    policy.version = id.version,
                    replaced = ?current.as_ref().map(|e| e.version()) },
                    "executor installed"
                );
                return Ok(next);
            }
            current = previous;
        }
    }

    /// 读取当前缓存的执行器，不触发构造。
    pub fn get(&self, id: i64) -> Option<Arc<E>> {
        self.cells.get(&id).and_then(|cell| cell.load_full())
    }

    /// 仅保留 `live` 中出现的策略 id，返回被清理的数量。
    pub fn retain(&self, live: &HashSet<i64>) -> usize {
        let before = self.cells.len();
        self.cells.retain(|id, _| live.contains(id));
        before.saturating_sub(self.cells.len())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// 累计构造次数（含竞争中被丢弃的构造）。
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn cell(&self, id: i64) -> Cell<E> {
        if let Some(cell) = self.cells.get(&id) {
            return Arc::clone(cell.value());
        }
        Arc::clone(
            self.cells
                .entry(id)
                .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
                .value(),
        )
    }
}

impl<E: VersionedExecutor> Default for VersionedExecutorFactory<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for VersionedExecutorFactory<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedExecutorFactory")
            .field("cells", &self.cells.len())
            .field("builds", &self.builds.load(Ordering::Relaxed))
            .finish()
    }
}

fn same<E>(a: &Option<Arc<E>>, b: &Option<Arc<E>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
