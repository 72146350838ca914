//! 策略标识与补全（supplement）约定。

use serde::{Deserialize, Serialize};

/// 策略的稳定标识与版本。
///
/// # 契约说明（What）
/// - `id` 在同一类策略内唯一，是执行器缓存的键；
/// - `version` 单调递增，执行器缓存与快照发布都以它判定新旧，永不回退。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId {
    pub id: i64,
    #[serde(default)]
    pub version: i64,
}

impl PolicyId {
    pub const fn new(id: i64, version: i64) -> Self {
        Self { id, version }
    }
}

/// 暴露策略标识的类型。
pub trait PolicyIdentified {
    fn policy_id(&self) -> PolicyId;
}

/// 用不那么具体的策略补全当前策略中未设置的字段。
///
/// # 教案式说明
/// - **意图 (Why)**：控制面只需在服务级声明一次策略，方法级、路径级自动继承；
/// - **契约 (What)**：只填补 `None` 或空集合字段，已显式设置的字段保持不变；
///   补全在快照构建期执行一次，决策路径上不再触发；
/// - **链路 (How)**：方法 ← 路径 ← 分组 ← 服务 ← 全局默认值。
pub trait Supplement {
    fn supplement(&mut self, source: &Self);
}

/// `Option` 字段补全：仅在目标为空时复制来源。
pub(crate) fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

/// 集合字段补全：仅在目标为空集合时复制来源。
pub(crate) fn fill_vec<T: Clone>(target: &mut Vec<T>, source: &[T]) {
    if target.is_empty() && !source.is_empty() {
        target.extend_from_slice(source);
    }
}

/// 字符串字段补全：仅在目标为空串时复制来源。
pub(crate) fn fill_str(target: &mut String, source: &str) {
    if target.is_empty() && !source.is_empty() {
        target.push_str(source);
    }
}
