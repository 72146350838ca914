//! # lifecycle 模块说明
//!
//! ## 角色定位（Why）
//! - 拦截框架把一次被治理的调用切成“进入 → 成功/失败 → 退出”几个钩子；治理逻辑挂在钩子上，
//!   而不是侵入业务代码；
//! - 退出钩子负责归还槽位、回报熔断结果与卸载载体，必须在任何路径上恰好执行一次：
//!   正常返回、`?` 提前返回、panic 展开，以及 Future 在中途被 Drop（调用方取消）。
//!
//! ## 契约（What）
//! - [`InvocationPhase`] 只允许 `Created → Entered → {Succeeded | Failed} → Exited`，
//!   `Entered → Exited` 仅在 Future 被中途 Drop 时出现；
//! - [`Interceptor::on_enter`] 返回治理拒绝（或取消、截止）时短路为 `Failed`，底层调用不执行；
//!   返回其他错误（内部错误）时记录告警并放行；
//! - [`InvocationGuard`] 在 Drop 中按进入的逆序调用 `on_exit`，随后推进到 `Exited` 并记录决策计数；
//!   执行前被取消（包括 Future 在排队时被 Drop）记为 [`Decision::Aborted`]。
//!
//! ## 风险（Trade-offs）
//! - `on_success` / `on_error` / `on_exit` 是同步钩子，便于在 Drop 中调用；需要挂起的治理逻辑
//!   只能放在 `on_enter`。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::carrier::CarrierSlot;
use crate::contract::CallContext;
use crate::error::GovernanceError;
use crate::observability::{DecisionStats, targets};
use crate::request::Request;

/// 一次调用的治理决策。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Decision {
    /// 未触发任何治理动作。
    #[default]
    Pass,
    RejectCircuitBreak,
    RejectRateLimit,
    RejectConcurrency,
    FaultInjected,
    /// 执行前因取消或截止到期而终止，不属于治理拒绝。
    Aborted,
    /// 命中路由规则，调用应发往给定单元/泳道。
    Routed {
        unit: Option<String>,
        lane: Option<String>,
    },
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::RejectCircuitBreak => "reject_circuit_break",
            Decision::RejectRateLimit => "reject_rate_limit",
            Decision::RejectConcurrency => "reject_concurrency",
            Decision::FaultInjected => "fault_injected",
            Decision::Aborted => "aborted",
            Decision::Routed { .. } => "routed",
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Decision::RejectCircuitBreak
                | Decision::RejectRateLimit
                | Decision::RejectConcurrency
                | Decision::FaultInjected
        )
    }
}

/// 调用方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 本服务接收的调用：载体在此创建，退出时卸载。
    Inbound,
    /// 本服务发起的下游调用：读取入站载体，可被重试。
    Outbound,
}

/// 调用阶段。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InvocationPhase {
    #[default]
    Created,
    Entered,
    Succeeded,
    Failed,
    Exited,
}

impl InvocationPhase {
    pub fn can_advance_to(self, next: InvocationPhase) -> bool {
        use InvocationPhase::*;
        matches!(
            (self, next),
            (Created, Entered)
                | (Created, Exited)
                | (Entered, Succeeded)
                | (Entered, Failed)
                | (Entered, Exited)
                | (Succeeded, Exited)
                | (Failed, Exited)
        )
    }
}

/// 按类型存取的调用级扩展槽，拦截器借此在钩子之间传递状态。
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// 单次调用的可变上下文。
pub struct InvocationContext<'r> {
    request: &'r dyn Request,
    call: CallContext,
    direction: Direction,
    phase: InvocationPhase,
    decision: Decision,
    error: Option<GovernanceError>,
    executed: bool,
    attempt: u32,
    carrier: CarrierSlot,
    owns_carrier: bool,
    extensions: Extensions,
}

impl<'r> InvocationContext<'r> {
    pub fn new(request: &'r dyn Request, call: CallContext, direction: Direction) -> Self {
        Self {
            request,
            call,
            direction,
            phase: InvocationPhase::Created,
            decision: Decision::Pass,
            error: None,
            executed: false,
            attempt: 1,
            carrier: CarrierSlot::new(),
            owns_carrier: false,
            extensions: Extensions::default(),
        }
    }

    /// 绑定外部挂载的载体句柄，退出时不卸载。
    pub fn with_carrier(mut self, carrier: CarrierSlot) -> Self {
        self.carrier = carrier;
        self.owns_carrier = false;
        self
    }

    /// 绑定本次调用挂载的载体句柄；入站调用退出时卸载。
    pub fn with_owned_carrier(mut self, carrier: CarrierSlot) -> Self {
        self.carrier = carrier;
        self.owns_carrier = true;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn request(&self) -> &'r dyn Request {
        self.request
    }

    pub fn call(&self) -> &CallContext {
        &self.call
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> InvocationPhase {
        self.phase
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn set_decision(&mut self, decision: Decision) {
        self.decision = decision;
    }

    /// 失败阶段记录的错误。
    pub fn error(&self) -> Option<&GovernanceError> {
        self.error.as_ref()
    }

    /// 底层调用是否已经开始执行。
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// 尝试序号，从 1 开始；只有出站重试会大于 1。
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn carrier(&self) -> &CarrierSlot {
        &self.carrier
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// 推进阶段；非法迁移被忽略并返回 `false`。
    pub fn advance(&mut self, next: InvocationPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            tracing::debug!(
                target: targets::LIFECYCLE,
                from = ?self.phase,
                to = ?next,
                "ignoring illegal phase transition"
            );
            return false;
        }
        self.phase = next;
        true
    }
}

impl std::fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("service", &self.request.service())
            .field("direction", &self.direction)
            .field("phase", &self.phase)
            .field("decision", &self.decision)
            .field("attempt", &self.attempt)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

/// 生命周期钩子。
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// 调用前执行；返回治理拒绝即短路。
    async fn on_enter(&self, ctx: &mut InvocationContext<'_>) -> Result<(), GovernanceError>;

    fn on_success(&self, _ctx: &mut InvocationContext<'_>) {}

    /// 调用失败或被拒绝；`ctx.executed()` 区分两者。
    fn on_error(&self, _ctx: &mut InvocationContext<'_>, _error: &GovernanceError) {}

    /// 恰好执行一次，包括调用 Future 被中途 Drop 的情况。
    fn on_exit(&self, _ctx: &mut InvocationContext<'_>) {}
}

/// 拦截器链与决策计数。
pub struct Lifecycle {
    interceptors: Vec<Arc<dyn Interceptor>>,
    stats: Arc<DecisionStats>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
            stats: Arc::new(DecisionStats::new()),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_stats(mut self, stats: Arc<DecisionStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<DecisionStats> {
        &self.stats
    }

    /// 在拦截器链内执行一次调用。
    ///
    /// `operation` 在全部 `on_enter` 通过后被调用一次，可从上下文读取决策与扩展槽；
    /// 返回的 Future 不得借用上下文。
    pub async fn run<'r, T, F, Fut>(
        &self,
        ctx: &mut InvocationContext<'r>,
        operation: F,
    ) -> Result<T, GovernanceError>
    where
        F: FnOnce(&InvocationContext<'r>) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        let mut guard = InvocationGuard::new(self, ctx);
        guard.context_mut().advance(InvocationPhase::Entered);
        for interceptor in &self.interceptors {
            guard.entered += 1;
            let Err(err) = interceptor.on_enter(guard.context_mut()).await else {
                continue;
            };
            if stops_the_call(&err) {
                tracing::debug!(
                    target: targets::LIFECYCLE,
                    code = err.code(),
                    "call rejected before execution"
                );
                if let Some(decision) = err.decision() {
                    guard.context_mut().set_decision(decision);
                }
                guard.fail(&err);
                return Err(err);
            }
            tracing::warn!(
                target: targets::LIFECYCLE,
                code = err.code(),
                error = %err,
                "interceptor failed, passing call through"
            );
            self.stats.record_internal_error();
        }

        guard.context_mut().executed = true;
        let pending = operation(guard.context());
        match pending.await {
            Ok(value) => {
                guard.succeed();
                Ok(value)
            }
            Err(err) => {
                guard.fail(&err);
                Err(err)
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

fn stops_the_call(err: &GovernanceError) -> bool {
    err.is_rejection()
        || matches!(
            err,
            GovernanceError::Cancelled { .. } | GovernanceError::DeadlineExceeded { .. }
        )
}

/// 退出守卫：Drop 时对已进入的拦截器逆序执行 `on_exit`。
pub struct InvocationGuard<'a, 'r> {
    lifecycle: &'a Lifecycle,
    ctx: &'a mut InvocationContext<'r>,
    entered: usize,
}

impl<'a, 'r> InvocationGuard<'a, 'r> {
    pub fn new(lifecycle: &'a Lifecycle, ctx: &'a mut InvocationContext<'r>) -> Self {
        Self {
            lifecycle,
            ctx,
            entered: 0,
        }
    }

    pub fn context(&self) -> &InvocationContext<'r> {
        self.ctx
    }

    pub fn context_mut(&mut self) -> &mut InvocationContext<'r> {
        self.ctx
    }

    fn entered(&self) -> &'a [Arc<dyn Interceptor>] {
        let lifecycle: &'a Lifecycle = self.lifecycle;
        let count = self.entered.min(lifecycle.interceptors.len());
        &lifecycle.interceptors[..count]
    }

    fn succeed(&mut self) {
        self.ctx.advance(InvocationPhase::Succeeded);
        for interceptor in self.entered() {
            interceptor.on_success(self.ctx);
        }
    }

    fn fail(&mut self, err: &GovernanceError) {
        self.ctx.error = Some(err.clone());
        self.ctx.advance(InvocationPhase::Failed);
        for interceptor in self.entered() {
            interceptor.on_error(self.ctx, err);
        }
    }
}

impl Drop for InvocationGuard<'_, '_> {
    fn drop(&mut self) {
        if self.ctx.phase == InvocationPhase::Entered {
            tracing::debug!(
                target: targets::LIFECYCLE,
                executed = self.ctx.executed,
                "invocation dropped before completion"
            );
        }
        if !self.ctx.executed && self.ctx.phase == InvocationPhase::Entered {
            self.ctx.decision = Decision::Aborted;
        }
        for interceptor in self.entered().iter().rev() {
            interceptor.on_exit(self.ctx);
        }
        if self.ctx.direction == Direction::Inbound && self.ctx.owns_carrier {
            self.ctx.carrier.detach();
        }
        self.ctx.advance(InvocationPhase::Exited);
        self.lifecycle.stats.record(&self.ctx.decision);
    }
}
