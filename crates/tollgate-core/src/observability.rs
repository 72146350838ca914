//! 可观测性契约：日志 target、结构化字段键名与决策计数。
//!
//! 教案式说明（Why）：治理决策散落在熔断、限流、故障注入与路由等组件中，
//! 统一 target 与字段键名后，运维可以按 `tollgate::circuit` 之类的前缀过滤，
//! 而不必依赖各处日志文案。
//! 契约定义（What）：[`targets`] 与 [`keys`] 只提供只读常量；[`DecisionStats`] 以原子计数
//! 记录每类决策次数，读取通过 [`DecisionStats::snapshot`] 得到一致性较弱但无锁的视图。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::lifecycle::Decision;

/// `tracing` 事件使用的 target。
pub mod targets {
    /// 快照发布、版本拒绝、执行器缓存清理。
    pub const POLICY: &str = "tollgate::policy";
    /// 熔断状态迁移与拒绝。
    pub const CIRCUIT: &str = "tollgate::circuit";
    /// 滑动窗口限流与并发隔离舱。
    pub const LIMIT: &str = "tollgate::limit";
    /// 故障注入命中。
    pub const FAULT: &str = "tollgate::fault";
    /// 重试尝试与耗尽。
    pub const RETRY: &str = "tollgate::retry";
    /// 生命周期阶段、内部错误放行与路由选择。
    pub const LIFECYCLE: &str = "tollgate::lifecycle";
}

/// 结构化日志字段键名。
pub mod keys {
    #[doc = "策略标识（`PolicyId::id`）。"]
    pub const FIELD_POLICY_ID: &str = "policy.id";
    #[doc = "策略版本（`PolicyId::version`）。"]
    pub const FIELD_POLICY_VERSION: &str = "policy.version";
    #[doc = "快照版本。"]
    pub const FIELD_SNAPSHOT_VERSION: &str = "snapshot.version";
    #[doc = "决策分类，取值见 `Decision::as_str`。"]
    pub const FIELD_DECISION: &str = "governance.decision";
    #[doc = "服务名。"]
    pub const FIELD_SERVICE: &str = "governance.service";
    #[doc = "重试尝试序号，从 1 开始。"]
    pub const FIELD_ATTEMPT: &str = "retry.attempt";
}

/// 按决策分类统计的计数器。
#[derive(Debug, Default)]
pub struct DecisionStats {
    pass: AtomicU64,
    routed: AtomicU64,
    circuit_break: AtomicU64,
    rate_limit: AtomicU64,
    concurrency: AtomicU64,
    fault_injected: AtomicU64,
    aborted: AtomicU64,
    internal_errors: AtomicU64,
}

/// [`DecisionStats`] 的只读快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecisionStatsSnapshot {
    pub pass: u64,
    pub routed: u64,
    pub circuit_break: u64,
    pub rate_limit: u64,
    pub concurrency: u64,
    pub fault_injected: u64,
    /// 执行前因取消或截止终止的调用。
    pub aborted: u64,
    pub internal_errors: u64,
}

impl DecisionStatsSnapshot {
    /// 被治理拒绝的调用总数（含故障注入）。
    pub fn rejected(&self) -> u64 {
        self.circuit_break + self.rate_limit + self.concurrency + self.fault_injected
    }
}

impl DecisionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, decision: &Decision) {
        let counter = match decision {
            Decision::Pass => &self.pass,
            Decision::Routed { .. } => &self.routed,
            Decision::RejectCircuitBreak => &self.circuit_break,
            Decision::RejectRateLimit => &self.rate_limit,
            Decision::RejectConcurrency => &self.concurrency,
            Decision::FaultInjected => &self.fault_injected,
            Decision::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次被吞掉的内部错误（放行处理）。
    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DecisionStatsSnapshot {
        DecisionStatsSnapshot {
            pass: self.pass.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            circuit_break: self.circuit_break.load(Ordering::Relaxed),
            rate_limit: self.rate_limit.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
            fault_injected: self.fault_injected.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }
}
