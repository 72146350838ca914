//! # policy 模块说明
//!
//! ## 角色定位（Why）
//! - 描述控制面下发的治理快照：多活空间、泳道空间、数据库集群与服务层级上的各类策略；
//! - 快照自反序列化起只读，决策路径通过 `Arc<GovernancePolicy>` 共享，无需加锁。
//!
//! ## 结构概览（What）
//! - [`id`]：策略标识、版本与补全约定；
//! - [`route`] / [`circuit`] / [`limit`] / [`fault`] / [`failover`]：各类策略；
//! - [`service`]：服务 → 分组 → 路径 → 方法的层级与策略解析；
//! - [`space`]：多活空间、泳道空间与数据库集群；
//! - [`snapshot`]：快照构建（补全、校验、索引预热）；
//! - [`supervisor`]：按版本单调替换快照的发布者。
//!
//! ## 查找约定（How）
//! - 所有按名称查找大小写不敏感，索引在首次访问时按小写键构建并缓存，构建快照时统一预热。

use std::collections::HashMap;
use std::sync::OnceLock;

pub mod circuit;
pub mod failover;
pub mod fault;
pub mod id;
pub mod limit;
pub mod route;
pub mod service;
pub mod snapshot;
pub mod space;
pub mod supervisor;

pub use circuit::{CircuitBreakLevel, CircuitBreakPolicy, DegradeConfig, SlidingWindowType};
pub use failover::{Backoff, FailoverPolicy};
pub use fault::{FaultInjectionPolicy, FaultKind};
pub use id::{PolicyId, PolicyIdentified, Supplement};
pub use limit::{ConcurrencyLimitPolicy, RateLimitPolicy, SlidingWindow};
pub use route::{RelationType, RoutePolicy, RouteTarget, TagCondition, TagKind, TagOperator, TagRule};
pub use service::{Service, ServiceGroup, ServiceMethod, ServicePath, ServicePolicy};
pub use snapshot::GovernancePolicy;
pub use space::{AccessMode, Cell, DatabaseCluster, Lane, LaneSpace, LiveSpace, Unit};
pub use supervisor::{PolicyEvent, PolicyListener, PolicySupervisor, PublishOutcome, SnapshotObserver};

/// 可按名称索引的节点。
pub(crate) trait Named {
    fn name(&self) -> &str;
}

/// 惰性构建的“小写名称 → 下标”索引。
///
/// 同名节点保留首次出现者。
#[derive(Clone, Debug, Default)]
pub(crate) struct NameIndex(OnceLock<HashMap<String, usize>>);

impl NameIndex {
    pub(crate) fn find<'a, T: Named>(&self, items: &'a [T], name: &str) -> Option<&'a T> {
        let index = self.0.get_or_init(|| build_index(items));
        index
            .get(&name.to_lowercase())
            .and_then(|&position| items.get(position))
    }

    pub(crate) fn warm<T: Named>(&self, items: &[T]) {
        self.0.get_or_init(|| build_index(items));
    }
}

fn build_index<T: Named>(items: &[T]) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        index.entry(item.name().to_lowercase()).or_insert(position);
    }
    index
}
