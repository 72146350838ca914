//! 韧性原语的集成测试：熔断、限流、隔离舱、故障注入与出站重试。
//!
//! 所有计时经由 `MockClock` 推进，除隔离舱的多任务用例外均在当前线程轮询完成。

mod bulkhead;
mod circuit;
mod fault;
mod rate_limit;
mod retry;

use std::sync::Arc;

use tollgate_core::policy::{Service, ServicePolicy};
use tollgate_core::resilience::FixedRandom;
use tollgate_core::{GovernanceEngine, GovernancePolicy, MockClock};

/// 构造使用虚拟时钟与固定抽样值的引擎。
pub(crate) fn engine_with(clock: Arc<MockClock>, draw: u32) -> GovernanceEngine {
    GovernanceEngine::builder()
        .clock(clock)
        .random(Arc::new(FixedRandom::new(draw)))
        .build()
        .expect("default config is valid")
}

/// 发布只包含单个服务的快照。
pub(crate) fn publish(engine: &GovernanceEngine, version: i64, service: &str, policy: ServicePolicy) {
    let outcome = engine.publish(GovernancePolicy::new(version).with_service(Service::new(service).with_policy(policy)));
    assert!(outcome.is_applied(), "快照版本必须递增");
}
