//! # engine 模块说明
//!
//! ## 角色定位（Why）
//! - 把快照发布、执行器缓存、标签匹配、各韧性原语与调用生命周期装配为一个对宿主可用的入口；
//! - 宿主的拦截层只需调用 [`GovernanceEngine::invoke_inbound`] 或
//!   [`GovernanceEngine::invoke_outbound`]，并在出站前调用 [`GovernanceEngine::transmit`]。
//!
//! ## 决策顺序（What）
//! 1. 解析当前快照中最具体的服务策略；快照缺失或无策略时放行；
//! 2. 故障注入（延迟累加，错误短路）；
//! 3. 熔断器逐条放行；
//! 4. 滑动窗口限流逐条放行；
//! 5. 并发隔离舱逐条获取槽位（可能排队）；
//! 6. 路由规则选择目标单元/泳道，决策记为 [`Decision::Routed`]。
//!
//! 任一环节拒绝即短路；此前已取得的熔断凭据与隔离舱槽位随调用级许可集合一并交回。
//! 策略无法构造执行器时记录告警并跳过该策略（放行）。
//!
//! ## 出站重试（How）
//! - 解析到失败重试策略且开关开启时，每次尝试都是一次完整的生命周期，熔断与限流逐次生效；
//! - 只有上游失败且错误码/状态码命中重试名单才会重试；
//! - 重试耗尽时返回 [`GovernanceError::RetryExhausted`]，携带最后一次上游错误。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use spin::Mutex;

use crate::carrier::{Carrier, CarrierSlot};
use crate::config::{FeatureSwitches, GovernanceConfig, RuntimeGovernanceConfig};
use crate::contract::CallContext;
use crate::error::{GovernanceError, PolicyError, UpstreamError};
use crate::executor::{VersionedExecutor, VersionedExecutorFactory};
use crate::lifecycle::{Decision, Direction, Interceptor, InvocationContext, Lifecycle};
use crate::matcher::TagMatcherRegistry;
use crate::observability::{DecisionStats, DecisionStatsSnapshot, targets};
use crate::policy::{
    GovernancePolicy, PolicyListener, PolicySupervisor, PublishOutcome, RouteTarget, ServicePolicy,
    SnapshotObserver,
};
use crate::request::{HeaderWriter, Request};
use crate::resilience::{
    CircuitBreaker, CircuitPermit, ConcurrencyLimiter, ConcurrencyPermit, FaultInjector, FaultOutcome,
    RandomSource, Retrier, SlidingWindowRateLimiter, ThreadRandom,
};
use crate::time::{Clock, SystemClock};

/// 被治理调用在执行时可见的准入信息。
#[derive(Clone, Debug)]
pub struct Admission {
    /// 尝试序号，从 1 开始。
    pub attempt: u32,
    pub decision: Decision,
    /// 命中路由规则时的完整目标（含单元格）。
    pub route: Option<RouteTarget>,
    /// 故障注入累计的延迟。
    pub injected_delay: Duration,
    /// 本次调用绑定的载体句柄。
    pub carrier: CarrierSlot,
}

impl Admission {
    fn from_context(ctx: &InvocationContext<'_>) -> Self {
        Self {
            attempt: ctx.attempt(),
            decision: ctx.decision().clone(),
            route: ctx.extensions().get::<RouteTarget>().cloned(),
            injected_delay: ctx
                .extensions()
                .get::<FaultOutcome>()
                .map_or(Duration::ZERO, |outcome| outcome.delayed),
            carrier: ctx.carrier().clone(),
        }
    }
}

/// 一次调用持有的熔断凭据与隔离舱槽位。
///
/// Drop 时交回尚未回报的熔断凭据，覆盖排队中被取消的路径。
struct GatePermits {
    circuits: Vec<(Arc<CircuitBreaker>, CircuitPermit)>,
    bulkheads: Vec<ConcurrencyPermit>,
    started: Instant,
}

impl GatePermits {
    fn new(started: Instant) -> Self {
        Self {
            circuits: Vec::new(),
            bulkheads: Vec::new(),
            started,
        }
    }
}

impl Drop for GatePermits {
    fn drop(&mut self) {
        for (breaker, permit) in self.circuits.drain(..) {
            breaker.release(permit);
        }
    }
}

/// 四类有状态执行器的缓存。
///
/// 订阅快照发布，快照切换后清理已不存在的策略 id。
#[derive(Default)]
pub struct ExecutorCaches {
    breakers: VersionedExecutorFactory<CircuitBreaker>,
    limiters: VersionedExecutorFactory<SlidingWindowRateLimiter>,
    bulkheads: VersionedExecutorFactory<ConcurrencyLimiter>,
    retriers: VersionedExecutorFactory<Retrier>,
}

impl ExecutorCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breakers(&self) -> &VersionedExecutorFactory<CircuitBreaker> {
        &self.breakers
    }

    pub fn limiters(&self) -> &VersionedExecutorFactory<SlidingWindowRateLimiter> {
        &self.limiters
    }

    pub fn bulkheads(&self) -> &VersionedExecutorFactory<ConcurrencyLimiter> {
        &self.bulkheads
    }

    pub fn retriers(&self) -> &VersionedExecutorFactory<Retrier> {
        &self.retriers
    }
}

impl SnapshotObserver for ExecutorCaches {
    fn on_snapshot(&self, snapshot: &Arc<GovernancePolicy>) {
        let live = snapshot.policy_ids();
        let evicted = self.breakers.retain(&live)
            + self.limiters.retain(&live)
            + self.bulkheads.retain(&live)
            + self.retriers.retain(&live);
        if evicted > 0 {
            tracing::info!(
                target: targets::POLICY,
                { snapshot.version = snapshot.version,
                evicted },
                "evicted executors of removed policies"
            );
        }
    }
}

impl std::fmt::Debug for ExecutorCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCaches")
            .field("breakers", &self.breakers.len())
            .field("limiters", &self.limiters.len())
            .field("bulkheads", &self.bulkheads.len())
            .field("retriers", &self.retriers.len())
            .finish()
    }
}

/// 执行器构造失败时按放行处理。
fn installed<E: VersionedExecutor>(
    built: Result<Arc<E>, PolicyError>,
    stats: &DecisionStats,
) -> Option<Arc<E>> {
    match built {
        Ok(executor) => Some(executor),
        Err(err) => {
            tracing::warn!(
                target: targets::POLICY,
                code = err.code(),
                error = %err,
                "skipping policy that cannot build an executor"
            );
            stats.record_internal_error();
            None
        }
    }
}

/// 治理拦截器：在 `on_enter` 中按固定顺序求值全部治理策略。
struct Governor {
    supervisor: Arc<PolicySupervisor>,
    config: Arc<RuntimeGovernanceConfig>,
    caches: Arc<ExecutorCaches>,
    matcher: Arc<TagMatcherRegistry>,
    faults: FaultInjector,
    clock: Arc<dyn Clock>,
    stats: Arc<DecisionStats>,
}

impl Governor {
    async fn admit(
        &self,
        policy: &ServicePolicy,
        switches: &FeatureSwitches,
        ctx: &mut InvocationContext<'_>,
        gate: &mut GatePermits,
    ) -> Result<(), GovernanceError> {
        let request = ctx.request();

        if switches.fault_injection && !policy.fault_injection_policies().is_empty() {
            let outcome = self
                .faults
                .inject(policy.fault_injection_policies(), &self.matcher, request, ctx.call())
                .await?;
            if outcome.injected > 0 {
                ctx.extensions_mut().insert(outcome);
            }
        }

        if switches.circuit_break {
            for circuit in policy.circuit_break_policies() {
                let built = self.caches.breakers.get_or_create(circuit, |p| {
                    CircuitBreaker::new(p.clone(), Arc::clone(&self.clock))
                });
                let Some(breaker) = installed(built, &self.stats) else {
                    continue;
                };
                let permit = breaker.acquire()?;
                gate.circuits.push((breaker, permit));
            }
        }

        if switches.rate_limit {
            for limit in policy.rate_limit_policies() {
                let built = self.caches.limiters.get_or_create(limit, |p| {
                    SlidingWindowRateLimiter::new(p.clone(), Arc::clone(&self.clock))
                });
                if let Some(limiter) = installed(built, &self.stats) {
                    limiter.try_acquire()?;
                }
            }
        }

        if switches.concurrency_limit {
            for limit in policy.concurrency_limit_policies() {
                let built = self.caches.bulkheads.get_or_create(limit, |p| {
                    ConcurrencyLimiter::new(p.clone(), Arc::clone(&self.clock))
                });
                let Some(bulkhead) = installed(built, &self.stats) else {
                    continue;
                };
                let permit = bulkhead.acquire(ctx.call()).await?;
                gate.bulkheads.push(permit);
            }
        }

        if switches.routing
            && let Some((route, rule)) = self.matcher.select_route(policy.route_policies(), request)
        {
            tracing::debug!(
                target: targets::LIFECYCLE,
                { policy.id = route.policy_id.id,
                rule.order = rule.order,
                unit = ?rule.target.unit,
                lane = ?rule.target.lane },
                "route rule matched"
            );
            ctx.set_decision(Decision::Routed {
                unit: rule.target.unit.clone(),
                lane: rule.target.lane.clone(),
            });
            ctx.extensions_mut().insert(rule.target.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Interceptor for Governor {
    async fn on_enter(&self, ctx: &mut InvocationContext<'_>) -> Result<(), GovernanceError> {
        let Some(snapshot) = self.supervisor.snapshot() else {
            return Ok(());
        };
        let request = ctx.request();
        let Some(policy) = snapshot.resolve(
            request.service(),
            request.group(),
            request.path(),
            request.method(),
        ) else {
            return Ok(());
        };
        let config = self.config.snapshot();

        let mut gate = GatePermits::new(self.clock.now());
        let admitted = self.admit(policy, &config.switches, ctx, &mut gate).await;
        gate.started = self.clock.now();
        ctx.extensions_mut().insert(gate);
        admitted
    }

    fn on_success(&self, ctx: &mut InvocationContext<'_>) {
        let Some(mut gate) = ctx.extensions_mut().remove::<GatePermits>() else {
            return;
        };
        let elapsed = self.clock.now().saturating_duration_since(gate.started);
        for (breaker, permit) in gate.circuits.drain(..) {
            breaker.on_success(permit, elapsed);
        }
    }

    fn on_error(&self, ctx: &mut InvocationContext<'_>, error: &GovernanceError) {
        let Some(mut gate) = ctx.extensions_mut().remove::<GatePermits>() else {
            return;
        };
        // 未执行的调用不计入熔断统计，凭据随 gate 一并交回。
        if !ctx.executed() || matches!(error, GovernanceError::Cancelled { .. }) {
            return;
        }
        let elapsed = self.clock.now().saturating_duration_since(gate.started);
        let code = error.upstream().and_then(UpstreamError::code);
        for (breaker, permit) in gate.circuits.drain(..) {
            breaker.on_error(permit, elapsed, code);
        }
    }

    fn on_exit(&self, ctx: &mut InvocationContext<'_>) {
        ctx.extensions_mut().remove::<GatePermits>();
    }
}

/// [`GovernanceEngine`] 构建器。
pub struct GovernanceEngineBuilder {
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    config: GovernanceConfig,
    matcher: TagMatcherRegistry,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl GovernanceEngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn config(mut self, config: GovernanceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn matcher(mut self, matcher: TagMatcherRegistry) -> Self {
        self.matcher = matcher;
        self
    }

    /// 追加宿主拦截器，位于治理拦截器之后。
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<GovernanceEngine, crate::error::ConfigError> {
        self.config.validate()?;
        let supervisor = Arc::new(PolicySupervisor::new());
        let caches = Arc::new(ExecutorCaches::new());
        supervisor.subscribe(caches.clone());
        let config = Arc::new(RuntimeGovernanceConfig::new(self.config));
        let stats = Arc::new(DecisionStats::new());

        let governor = Governor {
            supervisor: Arc::clone(&supervisor),
            config: Arc::clone(&config),
            caches: Arc::clone(&caches),
            matcher: Arc::new(self.matcher),
            faults: FaultInjector::new(self.random, Arc::clone(&self.clock)),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&stats),
        };
        let mut lifecycle = Lifecycle::new()
            .with_stats(stats)
            .with_interceptor(Arc::new(governor));
        for interceptor in self.interceptors {
            lifecycle = lifecycle.with_interceptor(interceptor);
        }

        Ok(GovernanceEngine {
            supervisor,
            config,
            caches,
            clock: self.clock,
            lifecycle,
        })
    }
}

impl Default for GovernanceEngineBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            config: GovernanceConfig::default(),
            matcher: TagMatcherRegistry::new(),
            interceptors: Vec::new(),
        }
    }
}

/// 流量治理引擎。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 首次发布快照前全部调用放行；
///   - 入站调用创建（或沿用已挂载的）载体并按配置捕获请求头与 Cookie，只卸载自己创建的载体；
///     出站调用读取传入的载体句柄；
///   - 每次调用恰好记录一次决策计数；重试的每次尝试各记一次；
/// - **风险 (Trade-offs)**：重试器在首次构造时固化配置中的幂等默认值，配置替换后需等策略
///   版本升级才会生效。
pub struct GovernanceEngine {
    supervisor: Arc<PolicySupervisor>,
    config: Arc<RuntimeGovernanceConfig>,
    caches: Arc<ExecutorCaches>,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
}

impl GovernanceEngine {
    pub fn builder() -> GovernanceEngineBuilder {
        GovernanceEngineBuilder::default()
    }

    pub fn supervisor(&self) -> &Arc<PolicySupervisor> {
        &self.supervisor
    }

    /// 发布新快照，等价于 `supervisor().publish(policy)`。
    pub fn publish(&self, policy: GovernancePolicy) -> PublishOutcome {
        self.supervisor.publish(policy)
    }

    /// 控制面订阅入口。
    pub fn listener(&self) -> Arc<dyn PolicyListener> {
        self.supervisor.clone()
    }

    pub fn config(&self) -> &Arc<RuntimeGovernanceConfig> {
        &self.config
    }

    pub fn caches(&self) -> &ExecutorCaches {
        &self.caches
    }

    pub fn stats(&self) -> DecisionStatsSnapshot {
        self.lifecycle.stats().snapshot()
    }

    /// 治理一次入站调用，为本次调用新建载体。
    pub async fn invoke_inbound<T, F, Fut>(
        &self,
        request: &dyn Request,
        call: CallContext,
        operation: F,
    ) -> Result<T, GovernanceError>
    where
        F: FnOnce(Admission) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        self.invoke_inbound_in(request, call, &CarrierSlot::new(), operation)
            .await
    }

    /// 在给定载体句柄上治理一次入站调用。
    ///
    /// 同一逻辑调用被多层入站拦截（例如网关过滤器之后再经过 RPC 服务端钩子）时，
    /// 内层传入外层的 [`Admission::carrier`]：句柄已挂载载体时沿用并补充捕获，
    /// 退出时不卸载；未挂载时新建载体，退出时由本次调用卸载。
    pub async fn invoke_inbound_in<T, F, Fut>(
        &self,
        request: &dyn Request,
        call: CallContext,
        carrier: &CarrierSlot,
        operation: F,
    ) -> Result<T, GovernanceError>
    where
        F: FnOnce(Admission) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        let config = self.config.snapshot();
        let require = &config.carrier.require;
        let mut captured = 0;
        let reused = carrier.is_attached();
        if reused {
            carrier.update(|current| captured = current.capture(require, request));
        } else {
            let mut fresh = Carrier::new();
            captured = fresh.capture(require, request);
            carrier.attach(fresh);
        }
        tracing::trace!(
            target: targets::LIFECYCLE,
            service = request.service(),
            captured,
            reused,
            "inbound carrier attached"
        );

        let ctx = InvocationContext::new(request, call, Direction::Inbound);
        let mut ctx = if reused {
            ctx.with_carrier(carrier.clone())
        } else {
            ctx.with_owned_carrier(carrier.clone())
        };
        self.lifecycle
            .run(&mut ctx, |ctx| operation(Admission::from_context(ctx)))
            .await
    }

    /// 治理一次出站调用，必要时按失败重试策略重放。
    ///
    /// `operation` 每次尝试调用一次；`carrier` 通常是入站调用 [`Admission::carrier`] 的克隆。
    /// 只有上游失败会触发重试；成功结果需要按内容重试时使用
    /// [`GovernanceEngine::invoke_outbound_when`]。
    pub async fn invoke_outbound<T, F, Fut>(
        &self,
        request: &dyn Request,
        call: CallContext,
        carrier: &CarrierSlot,
        operation: F,
    ) -> Result<T, GovernanceError>
    where
        F: FnMut(Admission) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        self.invoke_outbound_when(request, call, carrier, |_: &T| false, operation)
            .await
    }

    /// 同 [`GovernanceEngine::invoke_outbound`]，`retry_on` 为真的成功结果同样触发重试
    /// （例如响应体中的繁忙码）。
    ///
    /// 尝试用尽时返回最后一次的成功结果。
    pub async fn invoke_outbound_when<T, F, Fut, R>(
        &self,
        request: &dyn Request,
        call: CallContext,
        carrier: &CarrierSlot,
        retry_on: R,
        operation: F,
    ) -> Result<T, GovernanceError>
    where
        F: FnMut(Admission) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
        R: Fn(&T) -> bool,
    {
        let operation = Mutex::new(operation);
        let Some(retrier) = self.retrier_for(request) else {
            return self.attempt(request, &call, carrier, 1, &operation).await;
        };

        let policy = retrier.policy();
        let call_ref = &call;
        let operation_ref = &operation;
        let outcome = retrier
            .execute(
                call_ref,
                move |attempt| self.attempt(request, call_ref, carrier, attempt, operation_ref),
                |result: &Result<T, GovernanceError>| match result {
                    Ok(value) => retry_on(value),
                    Err(err) => {
                        let upstream = err.upstream();
                        err.is_retryable()
                            && policy.is_retryable(
                                upstream.and_then(UpstreamError::code),
                                upstream.and_then(UpstreamError::status),
                            )
                    }
                },
            )
            .await;
        match outcome {
            Ok(value) => Ok(value),
            Err(failure) if failure.is_exhausted() => {
                let attempts = failure.attempts;
                match failure.into_inner() {
                    GovernanceError::Upstream(last) => {
                        Err(GovernanceError::RetryExhausted { attempts, last })
                    }
                    other => Err(other),
                }
            }
            Err(failure) => Err(failure.into_inner()),
        }
    }

    /// 把载体写入出站请求，按配置补全前缀。
    pub fn transmit(&self, carrier: &CarrierSlot, writer: &mut dyn HeaderWriter) {
        if let Some(current) = carrier.current() {
            current.transmit_prefixed(writer, &self.config.snapshot().carrier.transmit_prefix);
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &dyn Request,
        call: &CallContext,
        carrier: &CarrierSlot,
        attempt: u32,
        operation: &Mutex<F>,
    ) -> Result<T, GovernanceError>
    where
        F: FnMut(Admission) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        let mut ctx = InvocationContext::new(request, call.clone(), Direction::Outbound)
            .with_carrier(carrier.clone())
            .with_attempt(attempt);
        self.lifecycle
            .run(&mut ctx, |ctx| {
                let admission = Admission::from_context(ctx);
                let mut guard = operation.lock();
                (&mut *guard)(admission)
            })
            .await
    }

    fn retrier_for(&self, request: &dyn Request) -> Option<Arc<Retrier>> {
        let config = self.config.snapshot();
        if !config.switches.retry {
            return None;
        }
        let snapshot = self.supervisor.snapshot()?;
        let failover = snapshot
            .resolve(request.service(), request.group(), request.path(), request.method())?
            .failover_policy()?;
        let built = self.caches.retriers.get_or_create(failover, |p| {
            let mut policy = p.clone();
            policy
                .require_idempotent
                .get_or_insert(config.retry.require_idempotent);
            Retrier::new(policy, Arc::clone(&self.clock))
        });
        installed(built, self.lifecycle.stats())
    }
}

impl std::fmt::Debug for GovernanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceEngine")
            .field("supervisor", &self.supervisor)
            .field("caches", &self.caches)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
