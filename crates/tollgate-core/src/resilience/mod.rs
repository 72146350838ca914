//! # resilience 模块说明
//!
//! ## 角色定位（Why）
//! - 承载由策略构造、带运行时状态的韧性执行器：熔断器、滑动窗口限流器、并发隔离舱、
//!   故障注入器与重试器；
//! - 执行器只关心“给定策略如何判定一次调用”，取策略、匹配标签与生命周期编排由
//!   [`crate::engine`] 负责。
//!
//! ## 契约（What）
//! - 除故障注入器外，每类执行器都实现 [`crate::executor::VersionedExecutor`]，
//!   通过 [`crate::executor::VersionedExecutorFactory`] 按策略 id 复用；
//! - 构造函数先校验策略，非法策略返回 [`crate::error::PolicyError`]，调用方按放行处理；
//! - 所有计时经由注入的 [`crate::time::Clock`]，测试可使用虚拟时钟复现时间序列。
//!
//! ## 挂起点（How）
//! - 只有隔离舱排队、故障延迟与重试退避会挂起，三者都与取消令牌竞速，并受截止时间约束。

pub mod circuit;
pub mod concurrency;
pub mod fault;
pub mod rate_limit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitPermit, CircuitState};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use fault::{FaultInjector, FaultOutcome, FixedRandom, RandomSource, ThreadRandom};
pub use rate_limit::SlidingWindowRateLimiter;
pub use retry::{Retrier, RetryFailure, RetryStop};
